//! Approval scanning session
//!
//! Pipeline per `(owner, chain)`:
//!   indexer logs → reconcile → (live verify ∥ NFT classify ∥ metadata) → enrich → rank
//!
//! `ScanSession` owns everything that outlives one scan: the per-chain
//! metadata cache, the in-flight guard and the current approval list. Scans
//! on different chains or owners may run concurrently.

use chrono::Utc;
use ethers::types::Address;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{ChainConfig, ScanSettings};
use crate::error::{ScanError, ScanResult};
use crate::metrics::Metrics;

use super::hypersync::LogSource;
use super::metadata::{MetadataCache, MetadataParams};
use super::reads::ContractReader;
use super::types::{ApprovalStats, EnrichedApproval, PairKey, ScanReport, ScanWarning};
use super::verify::VerifyParams;
use super::{classify, metadata, rank, reconcile, verify};

type ScanKey = (Address, String);

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// A scan for the same `(owner, chain)` was already running; nothing was done.
    AlreadyInFlight,
}

/// Removes its key from the in-flight set on drop, including on error paths.
struct InFlightGuard<'a> {
    set: &'a StdMutex<HashSet<ScanKey>>,
    key: ScanKey,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a StdMutex<HashSet<ScanKey>>, key: ScanKey) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.clone()) {
            return None;
        }
        Some(Self { set, key })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

#[derive(Debug, Clone, Default)]
struct CurrentList {
    chain: Option<String>,
    owner: Option<Address>,
    approvals: Vec<EnrichedApproval>,
}

pub struct ScanSession {
    chains: Vec<ChainConfig>,
    settings: ScanSettings,
    logs: Arc<dyn LogSource>,
    reader: Arc<dyn ContractReader>,
    metrics: Arc<Metrics>,
    metadata: Mutex<MetadataCache>,
    in_flight: StdMutex<HashSet<ScanKey>>,
    current: RwLock<CurrentList>,
}

impl ScanSession {
    pub fn new(
        chains: Vec<ChainConfig>,
        settings: ScanSettings,
        logs: Arc<dyn LogSource>,
        reader: Arc<dyn ContractReader>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            chains,
            settings,
            logs,
            reader,
            metrics,
            metadata: Mutex::new(MetadataCache::new()),
            in_flight: StdMutex::new(HashSet::new()),
            current: RwLock::new(CurrentList::default()),
        }
    }

    pub fn chain(&self, key: &str) -> Option<&ChainConfig> {
        let key = if key == "eth" { "mainnet" } else { key };
        self.chains.iter().find(|c| c.key == key)
    }

    pub fn chains(&self) -> &[ChainConfig] {
        &self.chains
    }

    #[cfg(test)]
    fn is_in_flight(&self, chain: &str, owner: Address) -> bool {
        let set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(&(owner, chain.to_string()))
    }

    /// Active approvals from the last completed scan of `(chain, owner)`, with
    /// confirmed revocations already removed. `None` if the current list
    /// belongs to another scan.
    pub async fn current_approvals(&self, chain: &str, owner: Address) -> Option<Vec<EnrichedApproval>> {
        let current = self.current.read().await;
        (current.chain.as_deref() == Some(chain) && current.owner == Some(owner))
            .then(|| current.approvals.clone())
    }

    /// Evict expired metadata entries; returns how many were dropped.
    pub async fn prune_metadata(&self) -> usize {
        let mut cache = self.metadata.lock().await;
        let pruned = cache.prune();
        if pruned > 0 {
            debug!("[METADATA] pruned {} expired entries, {} cached", pruned, cache.len());
        }
        pruned
    }

    pub async fn scan(&self, chain_key: &str, owner: Address) -> ScanResult<ScanOutcome> {
        let chain = self
            .chain(chain_key)
            .ok_or_else(|| ScanError::UnsupportedChain(chain_key.to_string()))?
            .clone();
        if !chain.scanning_supported {
            return Err(ScanError::ScanningDisabled(chain.name.clone()));
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, (owner, chain.key.clone())) else {
            info!("[SCAN] {} {:?} already in flight; ignoring request", chain.key, owner);
            self.metrics.record_scan(&chain.key, "in_flight", None);
            return Ok(ScanOutcome::AlreadyInFlight);
        };

        let started = Instant::now();

        match self.run_pipeline(&chain, owner).await {
            Ok(report) => {
                let secs = started.elapsed().as_secs_f64();
                self.metrics.record_scan(&chain.key, "completed", Some(secs));
                info!(
                    "[SCAN] {} {:?} done in {:.2}s: {} total, {} active, {} Permit2 active, {} warning(s)",
                    chain.key,
                    owner,
                    secs,
                    report.stats.total,
                    report.stats.active,
                    report.stats.permit2_active,
                    report.warnings.len()
                );
                let mut current = self.current.write().await;
                *current = CurrentList {
                    chain: Some(chain.key.clone()),
                    owner: Some(owner),
                    approvals: report.candidates(),
                };
                Ok(ScanOutcome::Completed(report))
            }
            Err(e) => {
                error!("[SCAN] {} {:?} failed: {}", chain.key, owner, e);
                self.metrics.record_scan(&chain.key, "failed", None);
                // No partial list survives a failed scan of the same pair
                let mut current = self.current.write().await;
                if current.chain.as_deref() == Some(chain.key.as_str()) && current.owner == Some(owner) {
                    *current = CurrentList::default();
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, chain: &ChainConfig, owner: Address) -> ScanResult<ScanReport> {
        let s = &self.settings;
        let mut warnings = Vec::new();

        let batch = self.logs.fetch_approval_logs(&chain.hypersync_url, owner).await?;
        if let Some(lag) = batch.lag() {
            if lag > s.lag_warning_blocks {
                warn!("[HYPERSYNC] {} indexer is {} blocks behind", chain.key, lag);
                warnings.push(ScanWarning::IndexerLag { blocks: lag });
            }
        }

        let outcome = reconcile::reconcile(&batch.logs, s.min_allowance());
        if outcome.decode_failures > 0 {
            warnings.push(ScanWarning::DecodeFailures {
                count: outcome.decode_failures,
            });
        }
        info!(
            "[RECONCILE] {} {} logs -> {} pairs ({} skipped, {} undecodable)",
            chain.key,
            batch.logs.len(),
            outcome.declarations.len(),
            outcome.skipped,
            outcome.decode_failures
        );
        let mut declarations = outcome.declarations;

        let tokens: Vec<Address> = declarations.iter().map(|d| d.token).collect();
        let verify_params = VerifyParams {
            min_allowance: s.min_allowance(),
            chunk_size: s.read_chunk_size,
            stale_min_batch: s.stale_min_batch,
        };
        let metadata_params = MetadataParams {
            chunk_size: s.read_chunk_size,
            ttl: chrono::Duration::seconds(s.metadata_ttl_secs),
            failed_ttl: chrono::Duration::seconds(s.failed_metadata_ttl_secs),
        };
        let reader = self.reader.as_ref();

        let (live, classes, meta) = tokio::join!(
            verify::verify_live_state(reader, &chain.key, owner, &declarations, verify_params),
            classify::classify_collections(reader, &chain.key, &declarations, s.read_chunk_size),
            metadata::ensure_metadata(reader, &chain.key, &tokens, &self.metadata, metadata_params),
        );

        classes.apply(&mut declarations);

        if live.failed_reads > 0 {
            self.metrics.record_read_failures(&chain.key, live.failed_reads);
        }
        if live
            .warnings
            .iter()
            .any(|w| matches!(w, ScanWarning::StaleData { .. }))
        {
            self.metrics.record_stale_data(&chain.key);
        }
        warnings.extend(live.warnings.iter().cloned());
        warnings.extend(classes.warning());
        warnings.extend(meta.warning());

        let mut approvals = rank::enrich(&declarations, &live.states, &meta.resolved, s.min_allowance());
        rank::rank(&mut approvals);

        Ok(ScanReport {
            owner,
            chain: chain.key.clone(),
            stats: ApprovalStats::from_approvals(&approvals),
            approvals,
            warnings,
            scanned_at: Utc::now(),
        })
    }

    /// Drop pairs confirmed revoked on-chain from the current list.
    pub async fn mark_revoked(&self, chain: &str, owner: Address, revoked: &[PairKey]) {
        let mut current = self.current.write().await;
        if current.chain.as_deref() != Some(chain) || current.owner != Some(owner) {
            return;
        }
        let revoked: HashSet<&PairKey> = revoked.iter().collect();
        current.approvals.retain(|a| !revoked.contains(&a.key()));
    }

    /// Re-scan once the indexer has had `delay` to observe new chain state.
    pub async fn rescan_after(
        &self,
        delay: Duration,
        chain: &str,
        owner: Address,
    ) -> ScanResult<ScanOutcome> {
        info!("[SCAN] Re-scanning {} {:?} in {:?}", chain, owner, delay);
        tokio::time::sleep(delay).await;
        self.scan(chain, owner).await
    }
}
