//! Batched contract reads
//!
//! `ContractReader` executes one chunk of view calls and reports a result per
//! call. `read_chunked` splits a call list into chunks, runs them with bounded
//! concurrency and isolates failures: a failed chunk only blanks its own slots.
//! `MulticallReader` is the Multicall3 implementation behind the RPC rotator.

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::contract::{Multicall, MulticallError, MULTICALL_ADDRESS};
use ethers::prelude::*;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::rpc_rotator::RpcRotator;

/// Chunks in flight at once per read pass.
const MAX_CHUNKS_IN_FLIGHT: usize = 4;
const READ_RETRIES: usize = 2;

abigen!(
    Erc20Token,
    r#"[
        function symbol() external view returns (string)
        function name() external view returns (string)
        function decimals() external view returns (uint8)
        function allowance(address owner, address spender) external view returns (uint256)
    ]"#
);

abigen!(
    OperatorToken,
    r#"[
        function isApprovedForAll(address owner, address operator) external view returns (bool)
        function supportsInterface(bytes4 interfaceId) external view returns (bool)
    ]"#
);

// ─── Calls & Values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCall {
    Allowance { token: Address, owner: Address, spender: Address },
    IsApprovedForAll { token: Address, owner: Address, operator: Address },
    SupportsInterface { token: Address, interface_id: [u8; 4] },
    Symbol(Address),
    Name(Address),
    Decimals(Address),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadValue {
    Uint(U256),
    Bool(bool),
    Text(String),
    Decimals(u8),
}

impl ReadValue {
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Decode a multicall return token according to what was asked.
fn decode_token(call: &ReadCall, token: Token) -> Option<ReadValue> {
    match call {
        ReadCall::Allowance { .. } => token.into_uint().map(ReadValue::Uint),
        ReadCall::IsApprovedForAll { .. } | ReadCall::SupportsInterface { .. } => {
            token.into_bool().map(ReadValue::Bool)
        }
        ReadCall::Symbol(_) | ReadCall::Name(_) => token.into_string().map(ReadValue::Text),
        ReadCall::Decimals(_) => token
            .into_uint()
            .filter(|v| *v <= U256::from(u8::MAX))
            .map(|v| ReadValue::Decimals(v.low_u32() as u8)),
    }
}

// ─── Seam ────────────────────────────────────────────────────────────────────

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractReader: Send + Sync {
    /// One result per call, `None` where that call reverted. `Err` means the
    /// whole chunk failed.
    async fn read_chunk(
        &self,
        chain: &str,
        calls: &[ReadCall],
    ) -> Result<Vec<Option<ReadValue>>, RpcError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedReads {
    pub values: Vec<Option<ReadValue>>,
    pub failed_chunks: usize,
    /// Slots that came back `None`, including every slot of a failed chunk.
    pub failed_calls: usize,
}

pub async fn read_chunked(
    reader: &dyn ContractReader,
    chain: &str,
    calls: &[ReadCall],
    chunk_size: usize,
) -> ChunkedReads {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<&[ReadCall]> = calls.chunks(chunk_size).collect();
    let chunks = &chunks;
    let results: Vec<(usize, Result<Vec<Option<ReadValue>>, RpcError>)> = stream::iter(
        0..chunks.len(),
    )
    .map(|i| async move {
        let chunk = chunks[i];
        let result = reader.read_chunk(chain, chunk).await;
        let result = match result {
            Ok(values) if values.len() != chunk.len() => Err(RpcError::Call(format!(
                "chunk returned {} results for {} calls",
                values.len(),
                chunk.len()
            ))),
            other => other,
        };
        (i, result)
    })
    .buffered(MAX_CHUNKS_IN_FLIGHT)
    .collect()
    .await;

    let mut out = ChunkedReads::default();
    for (i, result) in results {
        let len = calls.len().min((i + 1) * chunk_size) - i * chunk_size;
        match result {
            Ok(values) => out.values.extend(values),
            Err(e) => {
                warn!(
                    "[READ] {} chunk {} ({} calls) failed: {}",
                    chain,
                    i + 1,
                    len,
                    e
                );
                out.failed_chunks += 1;
                out.values.extend(std::iter::repeat(None).take(len));
            }
        }
    }
    out.failed_calls = out.values.iter().filter(|v| v.is_none()).count();
    out
}

// ─── Multicall3 ──────────────────────────────────────────────────────────────

pub struct MulticallReader {
    rotator: Arc<RpcRotator>,
}

impl MulticallReader {
    pub fn new(rotator: Arc<RpcRotator>) -> Self {
        Self { rotator }
    }
}

async fn aggregate(
    provider: Provider<Http>,
    calls: &[ReadCall],
) -> Result<Vec<Option<ReadValue>>, MulticallError<Provider<Http>>> {
    let client = Arc::new(provider);
    // Passing the address skips the chain-id lookup
    let mut multicall = Multicall::new(client.clone(), Some(MULTICALL_ADDRESS)).await?;

    for call in calls {
        match *call {
            ReadCall::Allowance { token, owner, spender } => {
                multicall.add_call(Erc20Token::new(token, client.clone()).allowance(owner, spender), true);
            }
            ReadCall::IsApprovedForAll { token, owner, operator } => {
                multicall.add_call(
                    OperatorToken::new(token, client.clone()).is_approved_for_all(owner, operator),
                    true,
                );
            }
            ReadCall::SupportsInterface { token, interface_id } => {
                multicall.add_call(
                    OperatorToken::new(token, client.clone()).supports_interface(interface_id),
                    true,
                );
            }
            ReadCall::Symbol(token) => {
                multicall.add_call(Erc20Token::new(token, client.clone()).symbol(), true);
            }
            ReadCall::Name(token) => {
                multicall.add_call(Erc20Token::new(token, client.clone()).name(), true);
            }
            ReadCall::Decimals(token) => {
                multicall.add_call(Erc20Token::new(token, client.clone()).decimals(), true);
            }
        }
    }

    let raw = multicall.call_raw().await?;
    Ok(calls
        .iter()
        .zip(raw)
        .map(|(call, result)| result.ok().and_then(|token| decode_token(call, token)))
        .collect())
}

#[async_trait]
impl ContractReader for MulticallReader {
    async fn read_chunk(
        &self,
        chain: &str,
        calls: &[ReadCall],
    ) -> Result<Vec<Option<ReadValue>>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let values = self
            .rotator
            .call_with_retry(chain, READ_RETRIES, |provider| aggregate(provider, calls))
            .await?;
        debug!(
            "[READ] {} multicall: {}/{} calls succeeded",
            chain,
            values.iter().filter(|v| v.is_some()).count(),
            calls.len()
        );
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowance_call(i: u64) -> ReadCall {
        ReadCall::Allowance {
            token: Address::from_low_u64_be(i),
            owner: Address::repeat_byte(0xee),
            spender: Address::repeat_byte(0x55),
        }
    }

    /// Echoes the token's low bits as the allowance; fails the configured chunk.
    struct EchoReader {
        fail_containing: Option<u64>,
    }

    #[async_trait]
    impl ContractReader for EchoReader {
        async fn read_chunk(
            &self,
            _chain: &str,
            calls: &[ReadCall],
        ) -> Result<Vec<Option<ReadValue>>, RpcError> {
            let ids: Vec<u64> = calls
                .iter()
                .map(|c| match c {
                    ReadCall::Allowance { token, .. } => token.to_low_u64_be(),
                    _ => 0,
                })
                .collect();
            if let Some(bad) = self.fail_containing {
                if ids.contains(&bad) {
                    return Err(RpcError::Call("execution reverted".into()));
                }
            }
            Ok(ids.into_iter().map(|id| Some(ReadValue::Uint(U256::from(id)))).collect())
        }
    }

    #[tokio::test]
    async fn test_middle_chunk_failure_is_isolated() {
        let calls: Vec<ReadCall> = (1..=120).map(allowance_call).collect();
        // chunk size 50 → [1..=50], [51..=100], [101..=120]; fail the second
        let reader = EchoReader {
            fail_containing: Some(75),
        };
        let out = read_chunked(&reader, "base", &calls, 50).await;

        assert_eq!(out.values.len(), 120);
        assert_eq!(out.failed_chunks, 1);
        assert_eq!(out.failed_calls, 50);
        assert_eq!(out.values[0], Some(ReadValue::Uint(U256::from(1))));
        assert_eq!(out.values[49], Some(ReadValue::Uint(U256::from(50))));
        assert!(out.values[50..100].iter().all(Option::is_none));
        assert_eq!(out.values[100], Some(ReadValue::Uint(U256::from(101))));
        assert_eq!(out.values[119], Some(ReadValue::Uint(U256::from(120))));
    }

    #[tokio::test]
    async fn test_short_chunk_response_counts_as_failure() {
        let mut reader = MockContractReader::new();
        reader
            .expect_read_chunk()
            .times(1)
            .returning(|_, _| Ok(vec![Some(ReadValue::Bool(true))]));

        let calls = vec![allowance_call(1), allowance_call(2)];
        let out = read_chunked(&reader, "base", &calls, 10).await;
        assert_eq!(out.values, vec![None, None]);
        assert_eq!(out.failed_chunks, 1);
    }

    #[tokio::test]
    async fn test_empty_call_list() {
        let mut reader = MockContractReader::new();
        reader.expect_read_chunk().never();
        let out = read_chunked(&reader, "base", &[], 50).await;
        assert!(out.values.is_empty());
        assert_eq!(out.failed_calls, 0);
    }

    #[test]
    fn test_decode_token_by_call_kind() {
        let token = Address::repeat_byte(1);
        assert_eq!(
            decode_token(&ReadCall::Decimals(token), Token::Uint(U256::from(6))),
            Some(ReadValue::Decimals(6))
        );
        assert_eq!(
            decode_token(&ReadCall::Decimals(token), Token::Uint(U256::from(300))),
            None
        );
        assert_eq!(
            decode_token(&ReadCall::Symbol(token), Token::String("WETH".into())),
            Some(ReadValue::Text("WETH".into()))
        );
        assert_eq!(
            decode_token(&allowance_call(1), Token::Bool(true)),
            None
        );
        assert_eq!(
            decode_token(
                &ReadCall::SupportsInterface { token, interface_id: [0xd9, 0xb6, 0x7a, 0x26] },
                Token::Bool(true)
            ),
            Some(ReadValue::Bool(true))
        );
    }
}
