//! Approval Sweeper
//!
//! Finds every live ERC20 allowance and NFT operator approval an address has
//! granted, ranks them by risk, and revokes them in a single EIP-7702
//! delegated self-transaction:
//!   scan   - indexer logs → reconcile → live reads → ranked report
//!   revoke - scan, then batch-revoke every active approval
//!   clear  - remove the account's delegation
//!   serve  - HTTP API over the scanner

mod config;
mod error;
mod metrics;
mod revoke {
    pub mod authorization;
    pub mod chain;
    pub mod orchestrator;
    pub mod plan;
    pub mod tx;
}
mod rpc_rotator;
mod scanner {
    pub mod cache;
    pub mod classify;
    pub mod hypersync;
    pub mod metadata;
    pub mod rank;
    pub mod reads;
    pub mod reconcile;
    pub mod session;
    pub mod types;
    pub mod verify;
}
mod server;

use clap::{Parser, Subcommand, ValueEnum};
use ethers::types::Address;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ChainConfig, DEFAULT_CONFIG_PATH};
use crate::error::ScanError;
use crate::metrics::Metrics;
use crate::revoke::authorization::DelegationStatus;
use crate::revoke::chain::{AccountChain, AuthorizingWallet, EthersAccountChain, LocalAuthorizingWallet};
use crate::revoke::orchestrator::{RevokeFailure, RevokeOrchestrator, RevokeState};
use crate::rpc_rotator::RpcRotator;
use crate::scanner::hypersync::HyperSyncClient;
use crate::scanner::reads::MulticallReader;
use crate::scanner::types::ScanReport;
use crate::scanner::session::{ScanOutcome, ScanSession};

// ─── Constants ───────────────────────────────────────────────────────────────

const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_FILTER: &str = "sweeper=info,tower_http=info";

type BoxError = Box<dyn std::error::Error>;

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "sweeper", version, about = "Scan and batch-revoke token approvals")]
struct Cli {
    /// TOML config file; missing file means built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan an address and print its approvals, riskiest first
    Scan {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        address: String,
        /// Include approvals that are no longer active
        #[arg(long)]
        all: bool,
    },
    /// Revoke every active approval of the SWEEPER_PRIVATE_KEY account
    Revoke {
        #[arg(long)]
        chain: String,
        /// Remove the delegation again once the revocation lands
        #[arg(long)]
        clear_delegation: bool,
    },
    /// Remove the account's EIP-7702 delegation
    Clear {
        #[arg(long)]
        chain: String,
    },
    /// Show the delegation state of an address
    Status {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        address: String,
    },
    /// List configured chains
    Chains,
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Log the full failure once and hand `main` only the short message.
fn scan_failed(e: ScanError) -> BoxError {
    error!("[SCAN] {}", e);
    e.user_message().into()
}

fn revoke_failed(failure: RevokeFailure) -> BoxError {
    error!("[REVOKE] {}", failure);
    failure.error.user_message().into()
}

fn parse_address(raw: &str) -> Result<Address, BoxError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| format!("invalid address {}: {}", raw, e).into())
}

// ─── Services ────────────────────────────────────────────────────────────────

struct Services {
    config: AppConfig,
    rotator: Arc<RpcRotator>,
    metrics: Arc<Metrics>,
    session: Arc<ScanSession>,
}

impl Services {
    fn build(config: AppConfig) -> Result<Self, BoxError> {
        let rotator = Arc::new(RpcRotator::from_chains(&config.chains));
        let metrics = Arc::new(Metrics::new()?);
        let logs = HyperSyncClient::new(
            config.secrets.hypersync_token.clone(),
            Duration::from_secs(config.scan.request_timeout_secs),
            config.scan.max_query_pages,
        )?;
        let reader = MulticallReader::new(rotator.clone());
        let session = Arc::new(ScanSession::new(
            config.chains.clone(),
            config.scan.clone(),
            Arc::new(logs),
            Arc::new(reader),
            metrics.clone(),
        ));
        info!(
            "[RPC] {} chains, {} endpoints",
            rotator.chain_count(),
            config.chains.iter().map(|c| c.rpc_urls.len()).sum::<usize>()
        );
        Ok(Self {
            config,
            rotator,
            metrics,
            session,
        })
    }

    fn chain(&self, key: &str) -> Result<ChainConfig, BoxError> {
        self.config
            .chain(key)
            .cloned()
            .ok_or_else(|| format!("unknown chain `{}`", key).into())
    }

    fn account_chain(&self, chain: &ChainConfig) -> Arc<EthersAccountChain> {
        Arc::new(EthersAccountChain::new(
            self.rotator.clone(),
            &chain.key,
            chain.chain_id,
            Duration::from_millis(self.config.revoke.receipt_poll_ms),
        ))
    }

    fn wallet(&self) -> Result<Arc<LocalAuthorizingWallet>, BoxError> {
        let key = self
            .config
            .secrets
            .private_key
            .as_deref()
            .ok_or("SWEEPER_PRIVATE_KEY is not set")?;
        Ok(Arc::new(LocalAuthorizingWallet::from_private_key(key)?))
    }

    async fn scan(&self, chain: &str, owner: Address) -> Result<ScanReport, BoxError> {
        match self.session.scan(chain, owner).await {
            Ok(ScanOutcome::Completed(report)) => Ok(report),
            Ok(ScanOutcome::AlreadyInFlight) => Err("a scan for this address is already running".into()),
            Err(e) => Err(scan_failed(e)),
        }
    }
}

// ─── Output ──────────────────────────────────────────────────────────────────

fn print_report(report: &ScanReport, all: bool) {
    let s = &report.stats;
    println!(
        "{:?} on {}: {} approvals, {} active ({} via Permit2), {} revoked",
        report.owner,
        report.chain,
        s.total,
        s.active,
        s.permit2_active,
        s.revoked
    );
    for a in report.approvals.iter().filter(|a| all || a.is_active) {
        println!(
            "  {:<8} {:<7} {:?} -> {:?}  {}{}{}",
            a.metadata.symbol,
            a.standard.to_string(),
            a.token,
            a.spender,
            a.display_allowance(),
            if a.is_permit2 { "  [Permit2]" } else { "" },
            if a.verified { "" } else { "  [unverified]" },
        );
    }
    for w in &report.warnings {
        println!("  ! {}", w);
    }
}

fn spawn_status_printer(mut rx: tokio::sync::watch::Receiver<RevokeState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let message = rx.borrow_and_update().status_message();
            println!("  {}", message);
        }
    })
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_scan(services: &Services, chain: &str, address: &str, all: bool) -> Result<(), BoxError> {
    let owner = parse_address(address)?;
    let report = services.scan(chain, owner).await?;
    print_report(&report, all);
    Ok(())
}

async fn cmd_revoke(services: &Services, chain: &str, clear_delegation: bool) -> Result<(), BoxError> {
    let chain = services.chain(chain)?;
    let wallet = services.wallet()?;
    let owner = wallet.address();

    let report = services.scan(&chain.key, owner).await?;
    print_report(&report, false);
    let candidates = services
        .session
        .current_approvals(&chain.key, owner)
        .await
        .unwrap_or_default();
    if candidates.is_empty() {
        println!("Nothing to revoke.");
        return Ok(());
    }

    let mut settings = services.config.revoke.clone();
    settings.clear_delegation |= clear_delegation;
    let settle = Duration::from_secs(settings.settle_delay_secs);

    let orchestrator = RevokeOrchestrator::new(
        &chain,
        settings,
        services.account_chain(&chain),
        wallet,
        services.metrics.clone(),
    )?;
    let printer = spawn_status_printer(orchestrator.subscribe());
    let result = orchestrator.run(&candidates).await;
    drop(orchestrator);
    let _ = printer.await;

    match result {
        Ok(outcome) => {
            for call in &outcome.completed {
                println!(
                    "  {} {:?} (block {})",
                    call.kind,
                    call.tx_hash,
                    call.block_number.map(|b| b.to_string()).unwrap_or_else(|| "?".into())
                );
            }
            for w in &outcome.warnings {
                println!("  ! {}", w);
            }
            services
                .session
                .mark_revoked(&chain.key, owner, &outcome.revoked_pairs())
                .await;
            match services.session.rescan_after(settle, &chain.key, owner).await {
                Ok(ScanOutcome::Completed(after)) => print_report(&after, false),
                Ok(ScanOutcome::AlreadyInFlight) => {}
                Err(e) => warn!("[SCAN] post-revoke re-scan failed: {}", e),
            }
            Ok(())
        }
        Err(failure) => {
            let confirmed = failure.revoked_pairs();
            if !confirmed.is_empty() {
                services.session.mark_revoked(&chain.key, owner, &confirmed).await;
                println!("  {} approval(s) were revoked before the failure", confirmed.len());
            }
            Err(revoke_failed(failure))
        }
    }
}

async fn cmd_clear(services: &Services, chain: &str) -> Result<(), BoxError> {
    let chain = services.chain(chain)?;
    let orchestrator = RevokeOrchestrator::new(
        &chain,
        services.config.revoke.clone(),
        services.account_chain(&chain),
        services.wallet()?,
        services.metrics.clone(),
    )?;
    match orchestrator.clear_delegation().await {
        Ok(Some(call)) => println!("Delegation cleared in {:?}", call.tx_hash),
        Ok(None) => println!("{:?} is not delegated.", orchestrator.owner()),
        Err(failure) => return Err(revoke_failed(failure)),
    }
    Ok(())
}

async fn cmd_status(services: &Services, chain: &str, address: &str) -> Result<(), BoxError> {
    let chain = services.chain(chain)?;
    let owner = parse_address(address)?;
    let code = services.account_chain(&chain).get_code(owner).await?;
    let status = DelegationStatus::from_code(&code);
    let expected = match (status, chain.delegate) {
        (DelegationStatus::Delegated(_), Some(delegate)) if status.is_delegated_to(delegate) => {
            " (sweeper delegate)"
        }
        (DelegationStatus::Delegated(_), _) => " (unknown delegate)",
        _ => "",
    };
    println!("{:?} on {}: {}{}", owner, chain.name, status, expected);
    Ok(())
}

fn cmd_chains(config: &AppConfig) {
    for c in &config.chains {
        println!(
            "{:<18} {:<20} id={:<10} scan={:<5} batch_revoke={}",
            c.key,
            c.name,
            c.chain_id,
            c.scanning_supported,
            c.delegate.is_some()
        );
    }
}

async fn cmd_serve(services: Services, port: Option<u16>) -> Result<(), BoxError> {
    let port = port.unwrap_or(services.config.server.port);

    let hc_rotator = services.rotator.clone();
    let hc_session = services.session.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
        loop {
            interval.tick().await;
            hc_rotator.health_check_all().await;
            let (healthy, total) = hc_rotator.health_summary().await;
            info!("[RPC] health {}/{}", healthy, total);
            hc_session.prune_metadata().await;
        }
    });

    let app = server::build_router(server::AppState {
        session: services.session.clone(),
        rotator: services.rotator.clone(),
        metrics: services.metrics.clone(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("[HTTP] Listening on 0.0.0.0:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

// ─── Entry Point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = AppConfig::load(&cli.config)?;
    info!(
        "[CONFIG] {} chains, scheme={:?}, clear_delegation={}",
        config.chains.len(),
        config.revoke.authorization_scheme,
        config.revoke.clear_delegation
    );

    if let Command::Chains = cli.command {
        cmd_chains(&config);
        return Ok(());
    }

    let services = Services::build(config)?;
    match cli.command {
        Command::Scan { chain, address, all } => cmd_scan(&services, &chain, &address, all).await,
        Command::Revoke {
            chain,
            clear_delegation,
        } => cmd_revoke(&services, &chain, clear_delegation).await,
        Command::Clear { chain } => cmd_clear(&services, &chain).await,
        Command::Status { chain, address } => cmd_status(&services, &chain, &address).await,
        Command::Serve { port } => cmd_serve(services, port).await,
        Command::Chains => Ok(()),
    }
}
