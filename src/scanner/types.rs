//! Approval data model: declarations from the log stream, live on-chain state,
//! token metadata, and the enriched records handed to the UI and orchestrator.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H160, U256};
use serde::{Deserialize, Serialize};

/// Permit2 singleton, identical on every chain.
pub const PERMIT2_ADDRESS: Address = H160([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0xd4, 0x73, 0x03, 0x0f, 0x11, 0x6d, 0xde, 0xe9, 0xf6, 0xb4,
    0x3a, 0xc7, 0x8b, 0xa3,
]);

/// Declared value for `ApprovalForAll(true)`.
pub const MAX_FOR_ALL: U256 = U256::MAX;

/// `(token, spender)`: the uniqueness key of an approval.
pub type PairKey = (Address, Address);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStandard {
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl TokenStandard {
    pub fn is_nft(self) -> bool {
        !matches!(self, Self::Erc20)
    }
}

impl std::fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Erc20 => write!(f, "ERC20"),
            Self::Erc721 => write!(f, "ERC721"),
            Self::Erc1155 => write!(f, "ERC1155"),
        }
    }
}

/// Happens-before position of a log. Field order gives the derived `Ord`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl LogPosition {
    pub fn new(block_number: u64, transaction_index: u64, log_index: u64) -> Self {
        Self {
            block_number,
            transaction_index,
            log_index,
        }
    }
}

// ─── Declarations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDeclaration {
    pub token: Address,
    pub spender: Address,
    /// Allowance from the log; `MAX_FOR_ALL` for an operator approval.
    pub declared_allowance: U256,
    pub standard: TokenStandard,
    pub observed_at: LogPosition,
}

impl ApprovalDeclaration {
    pub fn key(&self) -> PairKey {
        (self.token, self.spender)
    }
}

// ─── Live State ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LiveValue {
    Allowance(U256),
    Operator(bool),
}

impl LiveValue {
    /// Comparable magnitude for ranking; an operator approval counts as unlimited.
    pub fn magnitude(&self) -> U256 {
        match self {
            Self::Allowance(v) => *v,
            Self::Operator(true) => MAX_FOR_ALL,
            Self::Operator(false) => U256::zero(),
        }
    }

    /// ERC20: at or above the dust floor. NFT: the operator flag itself.
    pub fn is_active(&self, min_allowance: U256) -> bool {
        match self {
            Self::Allowance(v) => *v >= min_allowance,
            Self::Operator(approved) => *approved,
        }
    }

    /// The conservative stand-in for a failed read.
    pub fn inactive_for(standard: TokenStandard) -> Self {
        if standard.is_nft() {
            Self::Operator(false)
        } else {
            Self::Allowance(U256::zero())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveApprovalState {
    pub token: Address,
    pub spender: Address,
    pub current_value: LiveValue,
    pub is_active: bool,
    /// False when the read failed and `current_value` is the inactive default.
    pub verified: bool,
}

impl LiveApprovalState {
    pub fn key(&self) -> PairKey {
        (self.token, self.spender)
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

pub const PLACEHOLDER_SYMBOL: &str = "???";
pub const PLACEHOLDER_NAME: &str = "Unknown";
pub const DEFAULT_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

impl TokenMetadata {
    pub fn placeholder(address: Address) -> Self {
        Self {
            address,
            symbol: PLACEHOLDER_SYMBOL.to_string(),
            name: PLACEHOLDER_NAME.to_string(),
            decimals: DEFAULT_DECIMALS,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.symbol == PLACEHOLDER_SYMBOL
    }
}

// ─── Enriched ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedApproval {
    pub token: Address,
    pub spender: Address,
    pub standard: TokenStandard,
    pub declared_allowance: U256,
    pub current_value: LiveValue,
    pub is_active: bool,
    pub verified: bool,
    pub is_permit2: bool,
    pub metadata: TokenMetadata,
    pub observed_at: LogPosition,
}

impl EnrichedApproval {
    pub fn key(&self) -> PairKey {
        (self.token, self.spender)
    }

    /// Human-readable current allowance ("Unlimited", "All tokens", or decimal units).
    pub fn display_allowance(&self) -> String {
        match self.current_value {
            LiveValue::Operator(true) => "All tokens".to_string(),
            LiveValue::Operator(false) => "None".to_string(),
            LiveValue::Allowance(v) if v >= U256::MAX / 2 => "Unlimited".to_string(),
            LiveValue::Allowance(v) => ethers::utils::format_units(v, self.metadata.decimals as u32)
                .unwrap_or_else(|_| v.to_string()),
        }
    }
}

// ─── Warnings & Report ───────────────────────────────────────────────────────

/// Non-blocking conditions surfaced alongside a successful scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanWarning {
    IndexerLag { blocks: u64 },
    DecodeFailures { count: usize },
    ReadFailures { failed: usize, total: usize },
    StaleData { reads: usize },
    ClassificationFailures { failed: usize, total: usize },
    MetadataDegraded { failed: usize, total: usize },
}

impl std::fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexerLag { blocks } => {
                write!(f, "Approval index is {} blocks behind the chain tip", blocks)
            }
            Self::DecodeFailures { count } => write!(f, "{} log(s) could not be decoded", count),
            Self::ReadFailures { failed, total } => write!(
                f,
                "{}/{} on-chain reads failed; those approvals are shown as inactive and unverified",
                failed, total
            ),
            Self::StaleData { reads } => write!(
                f,
                "All {} on-chain reads returned zero. The RPC may be serving stale data; try scanning again",
                reads
            ),
            Self::ClassificationFailures { failed, total } => write!(
                f,
                "{}/{} NFT collections could not be classified; assumed ERC721",
                failed, total
            ),
            Self::MetadataDegraded { failed, total } => write!(
                f,
                "Metadata unavailable for {}/{} tokens; try scanning again",
                failed, total
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub total: usize,
    pub active: usize,
    pub revoked: usize,
    pub permit2_total: usize,
    pub permit2_active: usize,
}

impl ApprovalStats {
    pub fn from_approvals(approvals: &[EnrichedApproval]) -> Self {
        let active = approvals.iter().filter(|a| a.is_active).count();
        let permit2_total = approvals.iter().filter(|a| a.is_permit2).count();
        let permit2_active = approvals
            .iter()
            .filter(|a| a.is_permit2 && a.is_active)
            .count();
        Self {
            total: approvals.len(),
            active,
            revoked: approvals.len() - active,
            permit2_total,
            permit2_active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub owner: Address,
    pub chain: String,
    /// Every reconciled pair, risk-ordered.
    pub approvals: Vec<EnrichedApproval>,
    pub stats: ApprovalStats,
    pub warnings: Vec<ScanWarning>,
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    /// Revocation candidates: the active subset, still in risk order.
    pub fn candidates(&self) -> Vec<EnrichedApproval> {
        self.approvals.iter().filter(|a| a.is_active).cloned().collect()
    }
}
