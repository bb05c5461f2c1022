//! Account-chain and wallet seams used by the revocation orchestrator.
//!
//! `AccountChain` is everything the orchestrator asks of one chain: code,
//! nonce, fees, raw submission and receipts. `AuthorizingWallet` signs
//! authorizations and transaction hashes and may refuse. Ethers
//! implementations sit behind the RPC rotator and a local key.

use async_trait::async_trait;
use ethers::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::authorization::Authorization;
use super::tx::FeeEstimate;
use crate::config::AuthorizationScheme;
use crate::error::{RevokeError, RevokeResult, RpcError};
use crate::rpc_rotator::RpcRotator;

const CHAIN_RETRIES: usize = 3;
/// Receipt polls before a submitted transaction is reported dropped.
const MAX_RECEIPT_POLLS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReceiptSummary {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub success: bool,
}

// ─── Seams ───────────────────────────────────────────────────────────────────

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountChain: Send + Sync {
    fn chain_id(&self) -> u64;
    async fn get_code(&self, address: Address) -> RevokeResult<Vec<u8>>;
    async fn nonce(&self, address: Address) -> RevokeResult<u64>;
    async fn fees(&self) -> RevokeResult<FeeEstimate>;
    async fn send_raw(&self, raw: Bytes) -> RevokeResult<H256>;
    /// Resolves once mined. A transaction never mined is `TransactionDropped`.
    async fn wait_receipt(&self, tx_hash: H256) -> RevokeResult<ReceiptSummary>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizingWallet: Send + Sync {
    fn address(&self) -> Address;
    /// `SignatureRejected` when the holder declines.
    async fn sign_authorization(
        &self,
        authorization: &Authorization,
        scheme: AuthorizationScheme,
    ) -> RevokeResult<Signature>;
    async fn sign_transaction_hash(&self, hash: H256) -> RevokeResult<Signature>;
}

// ─── Ethers Chain ────────────────────────────────────────────────────────────

pub struct EthersAccountChain {
    rotator: Arc<RpcRotator>,
    chain: String,
    chain_id: u64,
    poll_interval: Duration,
}

impl EthersAccountChain {
    pub fn new(rotator: Arc<RpcRotator>, chain: &str, chain_id: u64, poll_interval: Duration) -> Self {
        Self {
            rotator,
            chain: chain.to_string(),
            chain_id,
            poll_interval,
        }
    }
}

fn chain_err(e: RpcError) -> RevokeError {
    RevokeError::Chain(e.to_string())
}

#[async_trait]
impl AccountChain for EthersAccountChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_code(&self, address: Address) -> RevokeResult<Vec<u8>> {
        let code = self
            .rotator
            .call_with_retry(&self.chain, CHAIN_RETRIES, |p| async move {
                p.get_code(address, None).await
            })
            .await
            .map_err(chain_err)?;
        Ok(code.to_vec())
    }

    async fn nonce(&self, address: Address) -> RevokeResult<u64> {
        let nonce = self
            .rotator
            .call_with_retry(&self.chain, CHAIN_RETRIES, |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await
            .map_err(chain_err)?;
        Ok(nonce.as_u64())
    }

    async fn fees(&self) -> RevokeResult<FeeEstimate> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .rotator
            .call_with_retry(&self.chain, CHAIN_RETRIES, |p| async move {
                p.estimate_eip1559_fees(None).await
            })
            .await
            .map_err(chain_err)?;
        Ok(FeeEstimate {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn send_raw(&self, raw: Bytes) -> RevokeResult<H256> {
        // Single attempt: a rejected raw transaction is not an endpoint fault.
        let provider = self.rotator.get_provider(&self.chain).await?;
        let pending = provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| RevokeError::Submission(e.to_string()))?;
        let hash = *pending;
        info!("[REVOKE] {} submitted {:?}", self.chain, hash);
        Ok(hash)
    }

    async fn wait_receipt(&self, tx_hash: H256) -> RevokeResult<ReceiptSummary> {
        for attempt in 1..=MAX_RECEIPT_POLLS {
            let receipt = self
                .rotator
                .call_with_retry(&self.chain, CHAIN_RETRIES, |p| async move {
                    p.get_transaction_receipt(tx_hash).await
                })
                .await;
            match receipt {
                Ok(Some(r)) => {
                    return Ok(ReceiptSummary {
                        tx_hash,
                        block_number: r.block_number.map(|b| b.as_u64()),
                        success: r.status == Some(U64::from(1)),
                    })
                }
                Ok(None) => debug!("[REVOKE] {:?} pending (poll {})", tx_hash, attempt),
                Err(e) => warn!("[REVOKE] receipt poll for {:?} failed: {}", tx_hash, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(RevokeError::TransactionDropped { tx_hash })
    }
}

// ─── Local Wallet ────────────────────────────────────────────────────────────

/// Signs with a private key held in process. Never rejects.
pub struct LocalAuthorizingWallet {
    wallet: LocalWallet,
}

impl LocalAuthorizingWallet {
    pub fn from_private_key(key: &str) -> RevokeResult<Self> {
        let wallet = key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RevokeError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self { wallet })
    }
}

#[async_trait]
impl AuthorizingWallet for LocalAuthorizingWallet {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_authorization(
        &self,
        authorization: &Authorization,
        scheme: AuthorizationScheme,
    ) -> RevokeResult<Signature> {
        let digest = authorization.digest(scheme)?;
        self.wallet
            .sign_hash(digest)
            .map_err(|e| RevokeError::Signing(e.to_string()))
    }

    async fn sign_transaction_hash(&self, hash: H256) -> RevokeResult<Signature> {
        self.wallet
            .sign_hash(hash)
            .map_err(|e| RevokeError::Signing(e.to_string()))
    }
}
