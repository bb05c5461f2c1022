//! Token metadata (symbol, name, decimals) through the session cache.
//!
//! Entries are keyed by `(chain, token)`: the same address on another chain is
//! another token. Three reads per uncached token, chunked like every other read
//! pass. Missing values fall back to placeholders; a placeholder symbol is
//! cached for the short failure TTL only.

use chrono::Duration;
use ethers::types::Address;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cache::TtlCache;
use super::reads::{read_chunked, ContractReader, ReadCall, ReadValue};
use super::types::{ScanWarning, TokenMetadata};

pub type MetadataCache = TtlCache<(String, Address), TokenMetadata>;

#[derive(Debug, Clone, Copy)]
pub struct MetadataParams {
    pub chunk_size: usize,
    pub ttl: Duration,
    pub failed_ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataOutcome {
    pub requested: usize,
    pub fetched: usize,
    pub failed: usize,
    /// Metadata for every requested token, as resolved by this call.
    pub resolved: HashMap<Address, TokenMetadata>,
}

impl MetadataOutcome {
    /// More than half the fetched tokens came back without a symbol.
    pub fn warning(&self) -> Option<ScanWarning> {
        (self.fetched > 0 && self.failed * 2 > self.fetched).then(|| ScanWarning::MetadataDegraded {
            failed: self.failed,
            total: self.fetched,
        })
    }
}

fn text(value: Option<&Option<ReadValue>>) -> Option<String> {
    match value {
        Some(Some(ReadValue::Text(s))) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn decimals(value: Option<&Option<ReadValue>>) -> Option<u8> {
    match value {
        Some(Some(ReadValue::Decimals(d))) => Some(*d),
        _ => None,
    }
}

/// Resolve metadata for `tokens` on `chain`, fetching whatever the cache does
/// not hold fresh.
pub async fn ensure_metadata(
    reader: &dyn ContractReader,
    chain: &str,
    tokens: &[Address],
    cache: &Mutex<MetadataCache>,
    params: MetadataParams,
) -> MetadataOutcome {
    let distinct: BTreeSet<Address> = tokens.iter().copied().collect();
    let mut resolved = HashMap::with_capacity(distinct.len());
    let mut uncached = Vec::new();
    {
        let cache = cache.lock().await;
        for &token in &distinct {
            match cache.get(&(chain.to_string(), token)) {
                Some(meta) => {
                    resolved.insert(token, meta);
                }
                None => uncached.push(token),
            }
        }
    }

    let mut outcome = MetadataOutcome {
        requested: distinct.len(),
        fetched: uncached.len(),
        failed: 0,
        resolved,
    };
    if uncached.is_empty() {
        return outcome;
    }

    let calls: Vec<ReadCall> = uncached
        .iter()
        .flat_map(|&t| [ReadCall::Symbol(t), ReadCall::Name(t), ReadCall::Decimals(t)])
        .collect();
    let reads = read_chunked(reader, chain, &calls, params.chunk_size).await;

    let mut cache = cache.lock().await;
    for (i, &token) in uncached.iter().enumerate() {
        let base = i * 3;
        let mut meta = TokenMetadata::placeholder(token);
        if let Some(symbol) = text(reads.values.get(base)) {
            meta.symbol = symbol;
        }
        if let Some(name) = text(reads.values.get(base + 1)) {
            meta.name = name;
        }
        if let Some(d) = decimals(reads.values.get(base + 2)) {
            meta.decimals = d;
        }

        let ttl = if meta.is_placeholder() {
            outcome.failed += 1;
            if outcome.failed <= 5 {
                debug!("[METADATA] {} no symbol for {:?}", chain, token);
            }
            params.failed_ttl
        } else {
            params.ttl
        };
        cache.put((chain.to_string(), token), meta.clone(), ttl);
        outcome.resolved.insert(token, meta);
    }

    if outcome.failed > 0 {
        warn!(
            "[METADATA] {} metadata missing for {}/{} tokens",
            chain, outcome.failed, outcome.fetched
        );
    }
    outcome
}
