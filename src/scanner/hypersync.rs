//! HyperSync log client
//!
//! One structured POST per page: every `Approval` / `ApprovalForAll` log whose
//! topic1 is the owner, from block 0 to the indexer's tip. Pages are followed
//! through `next_block` until `archive_height` or the page budget is reached.
//! Any non-2xx page aborts the whole query.

use async_trait::async_trait;
use ethers::types::Address;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ScanError, ScanResult};

pub const APPROVAL_TOPIC: &str =
    "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";
pub const APPROVAL_FOR_ALL_TOPIC: &str =
    "0x17307eab39ab6107e8899845ad3d59bd9653f200f220920489ca2b5937696c31";

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// A log record as the indexer returns it. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub topic0: Option<String>,
    #[serde(default)]
    pub topic1: Option<String>,
    #[serde(default)]
    pub topic2: Option<String>,
    #[serde(default)]
    pub topic3: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, deserialize_with = "de_quantity")]
    pub log_index: Option<u64>,
    #[serde(default, deserialize_with = "de_quantity")]
    pub transaction_index: Option<u64>,
    #[serde(default, deserialize_with = "de_quantity")]
    pub block_number: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BlockHeader {
    #[serde(default, deserialize_with = "de_quantity")]
    number: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBatch {
    #[serde(default)]
    blocks: Vec<BlockHeader>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Vec<ResponseBatch>,
    #[serde(default, deserialize_with = "de_quantity")]
    next_block: Option<u64>,
    #[serde(default, deserialize_with = "de_quantity")]
    archive_height: Option<u64>,
}

/// Numbers arrive as JSON integers or as hex/decimal strings depending on the
/// deployment.
fn de_quantity<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Num(u64),
        Str(String),
    }

    match Option::<Quantity>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Quantity::Num(n)) => Ok(Some(n)),
        Some(Quantity::Str(s)) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse::<u64>(),
            };
            parsed.map(Some).map_err(serde::de::Error::custom)
        }
    }
}

/// Flattened result of all pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBatch {
    pub logs: Vec<RawLog>,
    pub next_block: Option<u64>,
    pub archive_height: Option<u64>,
    pub pages: usize,
}

impl LogBatch {
    /// Blocks between where the indexer stopped and its reported tip.
    pub fn lag(&self) -> Option<u64> {
        match (self.archive_height, self.next_block) {
            (Some(height), Some(next)) => Some(height.saturating_sub(next)),
            _ => None,
        }
    }
}

// ─── Seam ────────────────────────────────────────────────────────────────────

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch_approval_logs(&self, endpoint: &str, owner: Address) -> ScanResult<LogBatch>;
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Owner address left-padded to a 32-byte topic, lowercase hex.
pub fn owner_topic(owner: Address) -> String {
    format!("0x{:0>64}", hex::encode(owner.as_bytes()))
}

pub fn build_query(owner: Address, from_block: u64) -> serde_json::Value {
    let owner = owner_topic(owner);
    serde_json::json!({
        "from_block": from_block,
        "logs": [
            { "topics": [[APPROVAL_TOPIC], [owner]] },
            { "topics": [[APPROVAL_FOR_ALL_TOPIC], [owner]] }
        ],
        "field_selection": {
            "block": ["number"],
            "log": [
                "block_number",
                "log_index",
                "transaction_index",
                "address",
                "data",
                "topic0",
                "topic1",
                "topic2",
                "topic3"
            ]
        }
    })
}

/// Logs without their own `block_number` inherit the first block of their batch.
fn flatten_batches(batches: Vec<ResponseBatch>, out: &mut Vec<RawLog>) {
    for batch in batches {
        let batch_block = batch.blocks.first().and_then(|b| b.number);
        for mut log in batch.logs {
            if log.block_number.is_none() {
                log.block_number = batch_block;
            }
            out.push(log);
        }
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct HyperSyncClient {
    http: Client,
    bearer_token: Option<String>,
    max_pages: usize,
}

impl HyperSyncClient {
    pub fn new(bearer_token: Option<String>, timeout: Duration, max_pages: usize) -> ScanResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            bearer_token,
            max_pages: max_pages.max(1),
        })
    }

    async fn query_page(
        &self,
        endpoint: &str,
        owner: Address,
        from_block: u64,
    ) -> ScanResult<QueryResponse> {
        let mut request = self.http.post(endpoint).json(&build_query(owner, from_block));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::QueryFailure {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<QueryResponse>().await?)
    }
}

#[async_trait]
impl LogSource for HyperSyncClient {
    async fn fetch_approval_logs(&self, endpoint: &str, owner: Address) -> ScanResult<LogBatch> {
        let mut batch = LogBatch::default();
        let mut from_block = 0u64;

        loop {
            let page = self.query_page(endpoint, owner, from_block).await?;
            batch.pages += 1;
            let before = batch.logs.len();
            flatten_batches(page.data, &mut batch.logs);
            batch.next_block = page.next_block;
            batch.archive_height = page.archive_height;

            debug!(
                "[HYPERSYNC] page {} from_block={} logs={} next_block={:?} archive_height={:?}",
                batch.pages,
                from_block,
                batch.logs.len() - before,
                page.next_block,
                page.archive_height
            );

            match (page.next_block, page.archive_height) {
                (Some(next), Some(height)) if next < height && next > from_block => {
                    if batch.pages >= self.max_pages {
                        warn!(
                            "[HYPERSYNC] Page budget ({}) exhausted at block {} of {}",
                            self.max_pages, next, height
                        );
                        break;
                    }
                    from_block = next;
                }
                _ => break,
            }
        }

        info!(
            "[HYPERSYNC] {} approval logs for {:?} in {} page(s)",
            batch.logs.len(),
            owner,
            batch.pages
        );
        Ok(batch)
    }
}
