//! Prometheus counters for scans and revocations, served at `/metrics`.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    scans_total: IntCounterVec,
    scan_duration: HistogramVec,
    stale_data_warnings: IntCounterVec,
    read_failures: IntCounterVec,
    revocations_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let scans_total = IntCounterVec::new(
            Opts::new("sweeper_scans_total", "Approval scans by chain and outcome"),
            &["chain", "outcome"],
        )?;
        let scan_duration = HistogramVec::new(
            HistogramOpts::new("sweeper_scan_duration_seconds", "Wall time of completed scans")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["chain"],
        )?;
        let stale_data_warnings = IntCounterVec::new(
            Opts::new(
                "sweeper_stale_data_warnings_total",
                "Scans whose live reads all came back zero",
            ),
            &["chain"],
        )?;
        let read_failures = IntCounterVec::new(
            Opts::new("sweeper_read_failures_total", "Failed live-state contract reads"),
            &["chain"],
        )?;
        let revocations_total = IntCounterVec::new(
            Opts::new("sweeper_revocations_total", "Batch revocations by chain and outcome"),
            &["chain", "outcome"],
        )?;

        registry.register(Box::new(scans_total.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;
        registry.register(Box::new(stale_data_warnings.clone()))?;
        registry.register(Box::new(read_failures.clone()))?;
        registry.register(Box::new(revocations_total.clone()))?;

        Ok(Self {
            registry,
            scans_total,
            scan_duration,
            stale_data_warnings,
            read_failures,
            revocations_total,
        })
    }

    pub fn record_scan(&self, chain: &str, outcome: &str, seconds: Option<f64>) {
        self.scans_total.with_label_values(&[chain, outcome]).inc();
        if let Some(secs) = seconds {
            self.scan_duration.with_label_values(&[chain]).observe(secs);
        }
    }

    pub fn record_stale_data(&self, chain: &str) {
        self.stale_data_warnings.with_label_values(&[chain]).inc();
    }

    pub fn record_read_failures(&self, chain: &str, count: usize) {
        self.read_failures
            .with_label_values(&[chain])
            .inc_by(count as u64);
    }

    pub fn record_revocation(&self, chain: &str, outcome: &str) {
        self.revocations_total.with_label_values(&[chain, outcome]).inc();
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("[METRICS] encode failed: {}", e);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
