//! Error taxonomy for scanning and revocation.
//!
//! Scan-level errors abort the scan and leave no partial approval list behind.
//! Per-log decode failures and per-call read failures are NOT errors here: they
//! are isolated, counted, and surfaced as `ScanWarning`s by the scanner.

use ethers::types::H256;
use thiserror::Error;

pub type ScanResult<T> = std::result::Result<T, ScanError>;
pub type RevokeResult<T> = std::result::Result<T, RevokeError>;

// ─── RPC ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("all RPC endpoints exhausted for chain: {0}")]
    AllEndpointsExhausted(String),
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("max retries exceeded: {0}")]
    MaxRetriesExceeded(String),
    #[error("rpc call failed: {0}")]
    Call(String),
    #[error("node rejected the request: {0}")]
    Rejected(String),
}

impl RpcError {
    /// Exhaustion and call failures are worth another endpoint. Config problems
    /// and requests the node itself refused are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllEndpointsExhausted(_) | Self::ConnectionFailed(_) | Self::Call(_)
        )
    }
}

// ─── Scan ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unknown chain `{0}`")]
    UnsupportedChain(String),
    #[error("scanning is not supported on {0}")]
    ScanningDisabled(String),
    #[error("log indexer returned HTTP {status}: {body}")]
    QueryFailure { status: u16, body: String },
    #[error("log indexer transport error: {0}")]
    Transport(String),
    #[error("log indexer returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ScanError {
    /// Short status line for a UI; the `Display` form carries the full detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedChain(chain) => format!("Unknown chain: {}", chain),
            Self::ScanningDisabled(name) => format!("Scanning not supported on {}", name),
            Self::QueryFailure { status, .. } => {
                format!("Approval index unavailable (HTTP {}). Try scanning again.", status)
            }
            Self::Transport(_) | Self::MalformedResponse(_) => {
                "Could not reach the approval index. Try scanning again.".to_string()
            }
            Self::Rpc(_) => "RPC endpoints unavailable. Try scanning again.".to_string(),
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

// ─── Revoke ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RevokeError {
    #[error("no delegate contract configured for chain {0}")]
    NoDelegate(String),
    #[error("no active approvals to revoke")]
    NothingToRevoke,
    #[error("wallet rejected the signature request: {0}")]
    SignatureRejected(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("transaction {tx_hash:?} reverted")]
    TransactionReverted { tx_hash: H256 },
    #[error("transaction {tx_hash:?} was dropped before confirmation")]
    TransactionDropped { tx_hash: H256 },
    #[error("transaction submission failed: {0}")]
    Submission(String),
    #[error("chain read failed: {0}")]
    Chain(String),
    #[error("invalid orchestrator transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl RevokeError {
    pub fn user_message(&self) -> String {
        match self {
            Self::NoDelegate(chain) => format!("Batch revoke is not available on {}", chain),
            Self::NothingToRevoke => "No active approvals to revoke".to_string(),
            Self::SignatureRejected(_) => "Signature request was rejected in the wallet".to_string(),
            Self::Signing(_) => "Could not sign the authorization".to_string(),
            Self::TransactionReverted { tx_hash } => {
                format!("Revoke transaction {:?} reverted; nothing was revoked", tx_hash)
            }
            Self::TransactionDropped { tx_hash } => {
                format!("Revoke transaction {:?} was not confirmed", tx_hash)
            }
            Self::Submission(_) => "Revoke transaction could not be submitted".to_string(),
            Self::Chain(_) | Self::Rpc(_) => "Network error while revoking".to_string(),
            Self::InvalidTransition { .. } => "Internal error: revoke flow out of order".to_string(),
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
