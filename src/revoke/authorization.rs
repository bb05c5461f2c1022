//! EIP-7702 authorizations and delegation designators.
//!
//! An authorization binds `(chain_id, address, nonce)`; the signed tuple is
//! `[chain_id, address, nonce, y_parity, r, s]`. An account delegated to
//! `address` carries the 23-byte code `0xef0100 || address`. Authorizing the
//! zero address clears the delegation.

use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::RlpStream;
use serde::{Deserialize, Serialize};

use crate::config::AuthorizationScheme;
use crate::error::RevokeError;

pub const DELEGATION_PREFIX: [u8; 3] = [0xef, 0x01, 0x00];
pub const DELEGATION_CODE_LEN: usize = 23;
/// Domain byte prepended to the RLP authorization before hashing.
pub const AUTHORIZATION_MAGIC: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub chain_id: u64,
    pub address: Address,
    pub nonce: u64,
}

impl Authorization {
    pub fn new(chain_id: u64, address: Address, nonce: u64) -> Self {
        Self {
            chain_id,
            address,
            nonce,
        }
    }

    /// Authorization that restores the account to a plain EOA.
    pub fn clear(chain_id: u64, nonce: u64) -> Self {
        Self::new(chain_id, Address::zero(), nonce)
    }

    pub fn is_clear(&self) -> bool {
        self.address.is_zero()
    }

    /// `keccak256(0x05 || rlp([chain_id, address, nonce]))`
    pub fn eip7702_digest(&self) -> H256 {
        let mut rlp = RlpStream::new_list(3);
        rlp.append(&U256::from(self.chain_id));
        rlp.append(&self.address);
        rlp.append(&self.nonce);
        let encoded = rlp.out();

        let mut msg = Vec::with_capacity(1 + encoded.len());
        msg.push(AUTHORIZATION_MAGIC);
        msg.extend_from_slice(&encoded);
        H256(keccak256(msg))
    }

    pub fn typed_data(&self) -> Result<TypedData, RevokeError> {
        let json = serde_json::json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" }
                ],
                "Authorization": [
                    { "name": "chainId", "type": "uint256" },
                    { "name": "address", "type": "address" },
                    { "name": "nonce", "type": "uint64" }
                ]
            },
            "primaryType": "Authorization",
            "domain": {
                "name": "EIP-7702",
                "version": "1",
                "chainId": self.chain_id
            },
            "message": {
                "chainId": self.chain_id,
                "address": format!("{:?}", self.address),
                "nonce": self.nonce
            }
        });
        serde_json::from_value(json).map_err(|e| RevokeError::Signing(format!("typed data: {}", e)))
    }

    /// EIP-712 hash of `Authorization(uint256 chainId,address address,uint64 nonce)`
    /// under domain `{ name: "EIP-7702", version: "1", chainId }`.
    pub fn eip712_digest(&self) -> Result<H256, RevokeError> {
        let typed = self.typed_data()?;
        typed
            .encode_eip712()
            .map(H256)
            .map_err(|e| RevokeError::Signing(format!("eip712: {}", e)))
    }

    pub fn digest(&self, scheme: AuthorizationScheme) -> Result<H256, RevokeError> {
        match scheme {
            AuthorizationScheme::Eip712 => self.eip712_digest(),
            AuthorizationScheme::Eip7702 => Ok(self.eip7702_digest()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAuthorization {
    pub authorization: Authorization,
    pub y_parity: u8,
    pub r: U256,
    pub s: U256,
}

impl SignedAuthorization {
    pub fn from_signature(authorization: Authorization, sig: Signature) -> Self {
        Self {
            authorization,
            y_parity: normalize_v(sig.v),
            r: sig.r,
            s: sig.s,
        }
    }

    pub fn signature(&self) -> Signature {
        Signature {
            r: self.r,
            s: self.s,
            v: 27 + self.y_parity as u64,
        }
    }

    /// Append `[chain_id, address, nonce, y_parity, r, s]`.
    pub fn rlp_append(&self, rlp: &mut RlpStream) {
        let auth = &self.authorization;
        rlp.begin_list(6);
        rlp.append(&U256::from(auth.chain_id));
        rlp.append(&auth.address);
        rlp.append(&auth.nonce);
        rlp.append(&self.y_parity);
        rlp.append(&self.r);
        rlp.append(&self.s);
    }

    /// Address that signed this authorization under `scheme`.
    pub fn recover_authority(&self, scheme: AuthorizationScheme) -> Result<Address, RevokeError> {
        let digest = self.authorization.digest(scheme)?;
        self.signature()
            .recover(digest)
            .map_err(|e| RevokeError::Signing(format!("recover: {}", e)))
    }
}

/// `v` as returned by signers is 27/28; typed transactions carry 0/1.
pub fn normalize_v(v: u64) -> u8 {
    if v >= 27 {
        (v - 27) as u8
    } else {
        v as u8
    }
}

// ─── Delegation Designator ───────────────────────────────────────────────────

pub fn delegation_code(target: Address) -> Vec<u8> {
    let mut code = Vec::with_capacity(DELEGATION_CODE_LEN);
    code.extend_from_slice(&DELEGATION_PREFIX);
    code.extend_from_slice(target.as_bytes());
    code
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "delegate", rename_all = "snake_case")]
pub enum DelegationStatus {
    NotDelegated,
    Delegated(Address),
    /// Deployed contract code that is not a delegation designator.
    Contract,
}

impl DelegationStatus {
    pub fn from_code(code: &[u8]) -> Self {
        if code.is_empty() {
            Self::NotDelegated
        } else if code.len() == DELEGATION_CODE_LEN && code[..3] == DELEGATION_PREFIX {
            Self::Delegated(Address::from_slice(&code[3..]))
        } else {
            Self::Contract
        }
    }

    pub fn is_delegated_to(&self, target: Address) -> bool {
        matches!(self, Self::Delegated(addr) if *addr == target)
    }
}

impl std::fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDelegated => write!(f, "not delegated"),
            Self::Delegated(addr) => write!(f, "delegated to {:?}", addr),
            Self::Contract => write!(f, "contract account"),
        }
    }
}
