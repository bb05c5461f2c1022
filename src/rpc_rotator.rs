//! RPC Rotator - per-chain round-robin over the configured RPC URLs
//!
//! Features:
//!   - Round-robin rotation across all available endpoints per chain
//!   - Per-endpoint cooldown on endpoint faults (500ms doubling to 16s)
//!   - Quarantine after repeated faults until a health check revives it
//!   - Node-side rejections (reverts, nonce errors) never count against an endpoint
//!   - Retry across endpoints via `backon`
//!   - Latency tracking (EMA)

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use ethers::prelude::*;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ChainConfig;
use crate::error::RpcError;

const QUARANTINE_AFTER_FAULTS: u32 = 5;
const BASE_COOLDOWN_MS: i64 = 500;
const MAX_COOLDOWN_SHIFT: u32 = 5;
/// Weight of the newest sample in the latency average.
const LATENCY_WEIGHT: f64 = 0.3;

/// Error text that describes the request rather than the endpoint serving it.
const REQUEST_FAULTS: &[&str] = &[
    "execution reverted",
    "nonce too low",
    "insufficient funds",
    "already known",
    "replacement transaction underpriced",
    "intrinsic gas too low",
    "invalid argument",
];

/// A failed call is `Rejected` when the node refused the request itself,
/// `Call` (retryable, endpoint fault) otherwise.
pub fn classify_call_error(url: &str, message: &str) -> RpcError {
    let lower = message.to_ascii_lowercase();
    if REQUEST_FAULTS.iter().any(|f| lower.contains(f)) {
        RpcError::Rejected(message.to_string())
    } else {
        RpcError::Call(format!("{}: {}", url, message))
    }
}

// ─── Endpoint State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EndpointState {
    pub url: String,
    pub chain: String,
    pub host: String,
    pub faults: u32,
    pub quarantined: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub calls: u64,
    pub errors: u64,
}

impl EndpointState {
    fn new(url: &str, chain: &str) -> Self {
        Self {
            url: url.to_string(),
            chain: chain.to_string(),
            host: host_label(url),
            faults: 0,
            quarantined: false,
            cooldown_until: None,
            latency_ms: None,
            calls: 0,
            errors: 0,
        }
    }

    fn cooldown(&self) -> chrono::Duration {
        let shift = self.faults.saturating_sub(1).min(MAX_COOLDOWN_SHIFT);
        chrono::Duration::milliseconds(BASE_COOLDOWN_MS << shift)
    }

    fn record_error(&mut self, err: &RpcError, now: DateTime<Utc>) {
        self.calls += 1;
        self.errors += 1;
        if !err.is_retryable() {
            return;
        }
        self.faults += 1;
        self.cooldown_until = Some(now + self.cooldown());
        if self.faults >= QUARANTINE_AFTER_FAULTS {
            self.quarantined = true;
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.calls += 1;
        self.faults = 0;
        self.cooldown_until = None;
        let sample = latency_ms as f64;
        self.latency_ms = Some(match self.latency_ms {
            Some(avg) => avg * (1.0 - LATENCY_WEIGHT) + sample * LATENCY_WEIGHT,
            None => sample,
        });
    }

    /// A passing health check lifts quarantine and cooldown.
    fn revive(&mut self) {
        self.quarantined = false;
        self.faults = 0;
        self.cooldown_until = None;
    }

    fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        !self.quarantined && self.cooldown_until.map_or(true, |until| now >= until)
    }
}

/// Host part of the URL, used as a short label in logs.
fn host_label(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

// ─── RPC Rotator ─────────────────────────────────────────────────────────────

pub struct RpcRotator {
    endpoints: Arc<RwLock<Vec<EndpointState>>>,
    chain_indices: HashMap<String, AtomicUsize>,
    http_client: Client,
}

impl RpcRotator {
    pub fn from_chains(chains: &[ChainConfig]) -> Self {
        let endpoints: Vec<EndpointState> = chains
            .iter()
            .flat_map(|c| c.rpc_urls.iter().map(move |url| EndpointState::new(url, &c.key)))
            .collect();

        let mut chain_indices = HashMap::new();
        for ep in &endpoints {
            chain_indices
                .entry(ep.chain.clone())
                .or_insert_with(|| AtomicUsize::new(0));
        }

        Self {
            endpoints: Arc::new(RwLock::new(endpoints)),
            chain_indices,
            http_client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn chain_count(&self) -> usize {
        self.chain_indices.len()
    }

    /// `(available, total)` endpoints across every chain.
    pub async fn health_summary(&self) -> (usize, usize) {
        let now = Utc::now();
        let eps = self.endpoints.read().await;
        let available = eps.iter().filter(|e| e.is_available_at(now)).count();
        (available, eps.len())
    }

    /// Next available RPC URL for a chain (round-robin)
    pub async fn get_rpc_url(&self, chain: &str) -> Result<String, RpcError> {
        let counter = self
            .chain_indices
            .get(chain)
            .ok_or_else(|| RpcError::UnsupportedChain(chain.to_string()))?;

        let now = Utc::now();
        let eps = self.endpoints.read().await;
        let chain_eps: Vec<&EndpointState> = eps
            .iter()
            .filter(|ep| ep.chain == chain && ep.is_available_at(now))
            .collect();

        if chain_eps.is_empty() {
            warn!("[RPC] All {} endpoints cooling down or quarantined", chain);
            return Err(RpcError::AllEndpointsExhausted(chain.to_string()));
        }

        let idx = counter.fetch_add(1, Ordering::Relaxed) % chain_eps.len();
        Ok(chain_eps[idx].url.clone())
    }

    pub async fn get_provider(&self, chain: &str) -> Result<Provider<Http>, RpcError> {
        let url = self.get_rpc_url(chain).await?;
        Provider::<Http>::try_from(url.as_str())
            .map_err(|e| RpcError::ConnectionFailed(format!("{}: {}", url, e)))
    }

    /// Run `f` against a fresh provider, rotating endpoints and backing off
    /// between attempts. Rejections and config errors return immediately.
    pub async fn call_with_retry<F, Fut, T, E>(
        &self,
        chain: &str,
        max_retries: usize,
        f: F,
    ) -> Result<T, RpcError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let f = &f;
        let attempt = move || async move {
            let url = self.get_rpc_url(chain).await?;
            let provider = Provider::<Http>::try_from(url.as_str())
                .map_err(|e| RpcError::ConnectionFailed(format!("{}: {}", url, e)))?;
            let start = std::time::Instant::now();
            match f(provider).await {
                Ok(result) => {
                    self.record_success(&url, start.elapsed().as_millis() as u64)
                        .await;
                    Ok::<T, RpcError>(result)
                }
                Err(e) => {
                    let err = classify_call_error(&url, &e.to_string());
                    self.record_error(&url, &err).await;
                    Err(err)
                }
            }
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(16))
            .with_max_times(max_retries);

        attempt
            .retry(&backoff)
            .when(|e: &RpcError| e.is_retryable())
            .notify(|e: &RpcError, dur: Duration| {
                let msg = e.to_string();
                if msg.contains("429") || msg.contains("rate limit") {
                    warn!("[RPC] 429 on {}. Rotating in {:?}", chain, dur);
                } else {
                    warn!("[RPC] {} call failed: {}. Retrying in {:?}", chain, msg, dur);
                }
            })
            .await
            .map_err(|e| match e {
                RpcError::Call(msg) | RpcError::AllEndpointsExhausted(msg) => {
                    RpcError::MaxRetriesExceeded(msg)
                }
                other => other,
            })
    }

    async fn record_success(&self, url: &str, latency_ms: u64) {
        let mut eps = self.endpoints.write().await;
        if let Some(ep) = eps.iter_mut().find(|ep| ep.url == url) {
            ep.record_success(latency_ms);
        }
    }

    async fn record_error(&self, url: &str, err: &RpcError) {
        let mut eps = self.endpoints.write().await;
        let Some(ep) = eps.iter_mut().find(|ep| ep.url == url) else {
            return;
        };
        ep.record_error(err, Utc::now());
        if err.is_retryable() {
            warn!(
                "[RPC] {} ({}) fault #{}; cooldown {}ms{}",
                ep.chain,
                ep.host,
                ep.faults,
                ep.cooldown().num_milliseconds(),
                if ep.quarantined { ", quarantined" } else { "" }
            );
        }
    }

    pub async fn health_check_all(&self) {
        let urls: Vec<String> = {
            let eps = self.endpoints.read().await;
            eps.iter().map(|ep| ep.url.clone()).collect()
        };

        for url in urls {
            let healthy = self.ping_endpoint(&url).await;
            let mut eps = self.endpoints.write().await;
            if let Some(ep) = eps.iter_mut().find(|ep| ep.url == url) {
                if healthy {
                    if ep.quarantined {
                        info!("[RPC] {} ({}) recovered", ep.chain, ep.host);
                    }
                    ep.revive();
                } else {
                    ep.quarantined = true;
                    warn!("[RPC] {} ({}) health check failed", ep.chain, ep.host);
                }
            }
        }
    }

    async fn ping_endpoint(&self, url: &str) -> bool {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_blockNumber",
            "params": [],
            "id": 1
        });

        match self.http_client.post(url).json(&body).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
