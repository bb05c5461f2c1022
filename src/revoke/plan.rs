//! Partition the active approvals into delegate calls.
//!
//! The delegate exposes:
//!   revokeERC20(address[] tokens, address[] spenders)
//!   revokeForAll(address[] collections, address[] operators)
//!   revokeAll(address[] tokens, address[] spenders, address[] collections, address[] operators)
//! A mixed set becomes one `revokeAll` when the delegate supports it, otherwise
//! `revokeERC20` then `revokeForAll`.

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes};
use ethers::utils::id;
use serde::Serialize;
use std::collections::HashSet;

use crate::error::{RevokeError, RevokeResult};
use crate::scanner::types::{EnrichedApproval, PairKey};

pub const REVOKE_ERC20_SIG: &str = "revokeERC20(address[],address[])";
pub const REVOKE_FOR_ALL_SIG: &str = "revokeForAll(address[],address[])";
pub const REVOKE_ALL_SIG: &str = "revokeAll(address[],address[],address[],address[])";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    RevokeErc20,
    RevokeForAll,
    RevokeAll,
    ClearDelegation,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RevokeErc20 => "revokeERC20",
            Self::RevokeForAll => "revokeForAll",
            Self::RevokeAll => "revokeAll",
            Self::ClearDelegation => "clearDelegation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateCall {
    RevokeErc20 {
        tokens: Vec<Address>,
        spenders: Vec<Address>,
    },
    RevokeForAll {
        collections: Vec<Address>,
        operators: Vec<Address>,
    },
    RevokeAll {
        tokens: Vec<Address>,
        spenders: Vec<Address>,
        collections: Vec<Address>,
        operators: Vec<Address>,
    },
}

fn addresses(list: &[Address]) -> Token {
    Token::Array(list.iter().copied().map(Token::Address).collect())
}

fn with_selector(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

impl DelegateCall {
    pub fn kind(&self) -> CallKind {
        match self {
            Self::RevokeErc20 { .. } => CallKind::RevokeErc20,
            Self::RevokeForAll { .. } => CallKind::RevokeForAll,
            Self::RevokeAll { .. } => CallKind::RevokeAll,
        }
    }

    pub fn calldata(&self) -> Bytes {
        match self {
            Self::RevokeErc20 { tokens, spenders } => {
                with_selector(REVOKE_ERC20_SIG, &[addresses(tokens), addresses(spenders)])
            }
            Self::RevokeForAll { collections, operators } => with_selector(
                REVOKE_FOR_ALL_SIG,
                &[addresses(collections), addresses(operators)],
            ),
            Self::RevokeAll {
                tokens,
                spenders,
                collections,
                operators,
            } => with_selector(
                REVOKE_ALL_SIG,
                &[
                    addresses(tokens),
                    addresses(spenders),
                    addresses(collections),
                    addresses(operators),
                ],
            ),
        }
    }

    /// `(token, spender)` pairs this call zeroes.
    pub fn pairs(&self) -> Vec<PairKey> {
        let zip = |a: &[Address], b: &[Address]| -> Vec<PairKey> {
            a.iter().copied().zip(b.iter().copied()).collect()
        };
        match self {
            Self::RevokeErc20 { tokens, spenders } => zip(tokens, spenders),
            Self::RevokeForAll { collections, operators } => zip(collections, operators),
            Self::RevokeAll {
                tokens,
                spenders,
                collections,
                operators,
            } => {
                let mut pairs = zip(tokens, spenders);
                pairs.extend(zip(collections, operators));
                pairs
            }
        }
    }

    pub fn item_count(&self) -> usize {
        self.pairs().len()
    }
}

/// Active candidates split into delegate calls, in submission order.
pub fn plan_revocation(
    candidates: &[EnrichedApproval],
    supports_revoke_all: bool,
) -> RevokeResult<Vec<DelegateCall>> {
    let mut seen: HashSet<PairKey> = HashSet::new();
    let (mut tokens, mut spenders) = (Vec::new(), Vec::new());
    let (mut collections, mut operators) = (Vec::new(), Vec::new());

    for approval in candidates.iter().filter(|a| a.is_active) {
        if !seen.insert(approval.key()) {
            continue;
        }
        if approval.standard.is_nft() {
            collections.push(approval.token);
            operators.push(approval.spender);
        } else {
            tokens.push(approval.token);
            spenders.push(approval.spender);
        }
    }

    let calls = match (tokens.is_empty(), collections.is_empty()) {
        (true, true) => return Err(RevokeError::NothingToRevoke),
        (false, true) => vec![DelegateCall::RevokeErc20 { tokens, spenders }],
        (true, false) => vec![DelegateCall::RevokeForAll {
            collections,
            operators,
        }],
        (false, false) if supports_revoke_all => vec![DelegateCall::RevokeAll {
            tokens,
            spenders,
            collections,
            operators,
        }],
        (false, false) => vec![
            DelegateCall::RevokeErc20 { tokens, spenders },
            DelegateCall::RevokeForAll {
                collections,
                operators,
            },
        ],
    };
    Ok(calls)
}
