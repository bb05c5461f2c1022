//! Configuration: optional `sweeper.toml`, `SWEEPER_*` environment overrides,
//! and the built-in chain table.
//!
//! A missing config file is not an error; every section has defaults. Chain
//! entries in the file replace the built-in entry with the same `key`.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "sweeper.toml";
const ENV_PREFIX: &str = "SWEEPER_";

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// ERC20 allowances below this many base units are dust.
    pub min_allowance: u64,
    /// Contract reads per multicall chunk.
    pub read_chunk_size: usize,
    pub metadata_ttl_secs: i64,
    /// TTL for placeholder metadata after a failed read.
    pub failed_metadata_ttl_secs: i64,
    pub lag_warning_blocks: u64,
    /// All-zero results across at least this many reads raise a stale-data warning.
    pub stale_min_batch: usize,
    pub max_query_pages: usize,
    pub request_timeout_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            min_allowance: 100,
            read_chunk_size: 50,
            metadata_ttl_secs: 60 * 60,
            failed_metadata_ttl_secs: 5 * 60,
            lag_warning_blocks: 1_000,
            stale_min_batch: 5,
            max_query_pages: 20,
            request_timeout_secs: 30,
        }
    }
}

impl ScanSettings {
    pub fn min_allowance(&self) -> U256 {
        U256::from(self.min_allowance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationScheme {
    /// EIP-712 typed data `Authorization(chainId,address,nonce)`, domain "EIP-7702" v1.
    Eip712,
    /// `keccak256(0x05 || rlp([chain_id, address, nonce]))`.
    Eip7702,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevokeSettings {
    pub clear_delegation: bool,
    pub settle_delay_secs: u64,
    pub authorization_scheme: AuthorizationScheme,
    pub base_gas: u64,
    pub gas_per_item: u64,
    pub gas_per_authorization: u64,
    pub receipt_poll_ms: u64,
}

impl Default for RevokeSettings {
    fn default() -> Self {
        Self {
            clear_delegation: false,
            settle_delay_secs: 5,
            authorization_scheme: AuthorizationScheme::Eip712,
            base_gas: 60_000,
            gas_per_item: 35_000,
            gas_per_authorization: 25_000,
            receipt_poll_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ─── Chains ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub key: String,
    pub name: String,
    pub chain_id: u64,
    pub hypersync_url: String,
    #[serde(default = "default_true")]
    pub scanning_supported: bool,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub delegate: Option<Address>,
    #[serde(default = "default_true")]
    pub delegate_supports_revoke_all: bool,
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    fn builtin(
        key: &str,
        name: &str,
        chain_id: u64,
        hypersync: &str,
        rpc_urls: &[&str],
        delegate: Option<&str>,
    ) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            chain_id,
            hypersync_url: format!("https://{}.hypersync.xyz/query", hypersync),
            scanning_supported: true,
            rpc_urls: rpc_urls.iter().map(|u| u.to_string()).collect(),
            delegate: delegate.and_then(|d| d.parse().ok()),
            delegate_supports_revoke_all: true,
        }
    }
}

pub fn default_chains() -> Vec<ChainConfig> {
    vec![
        // ── Mainnets ──
        ChainConfig::builtin(
            "mainnet",
            "Ethereum",
            1,
            "eth",
            &["https://ethereum-rpc.publicnode.com", "https://rpc.ankr.com/eth", "https://1rpc.io/eth"],
            None,
        ),
        ChainConfig::builtin(
            "base",
            "Base",
            8453,
            "base",
            &["https://mainnet.base.org", "https://base-rpc.publicnode.com", "https://rpc.ankr.com/base"],
            None,
        ),
        ChainConfig::builtin(
            "optimism",
            "OP Mainnet",
            10,
            "optimism",
            &["https://mainnet.optimism.io", "https://optimism-rpc.publicnode.com"],
            None,
        ),
        ChainConfig::builtin(
            "arbitrum",
            "Arbitrum One",
            42161,
            "arbitrum",
            &["https://arb1.arbitrum.io/rpc", "https://arbitrum-one-rpc.publicnode.com", "https://rpc.ankr.com/arbitrum"],
            None,
        ),
        ChainConfig::builtin(
            "polygon",
            "Polygon",
            137,
            "polygon",
            &["https://polygon-rpc.com", "https://polygon-bor-rpc.publicnode.com", "https://rpc.ankr.com/polygon"],
            None,
        ),
        ChainConfig::builtin(
            "bsc",
            "BNB Smart Chain",
            56,
            "bsc",
            &["https://bsc-dataseed.bnbchain.org", "https://bsc-rpc.publicnode.com"],
            None,
        ),
        // ── Testnets ──
        ChainConfig::builtin(
            "sepolia",
            "Sepolia",
            11155111,
            "sepolia",
            &["https://ethereum-sepolia-rpc.publicnode.com"],
            Some("0xd9ee9b61071b339ac3ae5a86eb139a1f36ab6b23"),
        ),
        ChainConfig::builtin(
            "base-sepolia",
            "Base Sepolia",
            84532,
            "base-sepolia",
            &["https://sepolia.base.org", "https://base-sepolia-rpc.publicnode.com"],
            Some("0x81bacfd7401e69328c0aa6501757e5e4137f0b14"),
        ),
        ChainConfig::builtin(
            "optimism-sepolia",
            "OP Sepolia",
            11155420,
            "optimism-sepolia",
            &["https://sepolia.optimism.io"],
            None,
        ),
        ChainConfig::builtin(
            "arbitrum-sepolia",
            "Arbitrum Sepolia",
            421614,
            "arbitrum-sepolia",
            &["https://sepolia-rollup.arbitrum.io/rpc"],
            None,
        ),
        ChainConfig::builtin(
            "polygon-amoy",
            "Polygon Amoy",
            80002,
            "polygon-amoy",
            &["https://rpc-amoy.polygon.technology"],
            None,
        ),
        ChainConfig::builtin(
            "bsc-testnet",
            "BNB Testnet",
            97,
            "bsc-testnet",
            &["https://bsc-testnet-rpc.publicnode.com"],
            None,
        ),
    ]
}

// ─── Secrets ─────────────────────────────────────────────────────────────────

/// Values that only ever come from the environment.
#[derive(Clone, Default)]
pub struct Secrets {
    pub hypersync_token: Option<String>,
    pub private_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("hypersync_token", &self.hypersync_token.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    hypersync_token: Option<String>,
    private_key: Option<String>,
    port: Option<u16>,
    clear_delegation: Option<bool>,
}

// ─── App Config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanSettings,
    pub revoke: RevokeSettings,
    pub server: ServerSettings,
    pub chains: Vec<ChainConfig>,
    #[serde(skip)]
    pub secrets: Secrets,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scan: ScanSettings::default(),
            revoke: RevokeSettings::default(),
            server: ServerSettings::default(),
            chains: default_chains(),
            secrets: Secrets::default(),
        }
    }
}

/// File-level shape: chains listed here are merged over the built-ins.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    scan: ScanSettings,
    revoke: RevokeSettings,
    server: ServerSettings,
    chains: Vec<ChainConfig>,
}

impl AppConfig {
    /// Load file + process environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        let env = envy::prefixed(ENV_PREFIX).from_env::<EnvOverrides>()?;
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("[CONFIG] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let parsed = Self::from_toml_str(&raw)?;
        info!(
            "[CONFIG] Loaded {} ({} chains)",
            path.display(),
            parsed.chains.len()
        );
        Ok(parsed)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        let mut chains = default_chains();
        for chain in file.chains {
            match chains.iter_mut().find(|c| c.key == chain.key) {
                Some(existing) => *existing = chain,
                None => chains.push(chain),
            }
        }
        Ok(Self {
            scan: file.scan,
            revoke: file.revoke,
            server: file.server,
            chains,
            secrets: Secrets::default(),
        })
    }

    fn apply_env(&mut self, env: EnvOverrides) {
        if let Some(port) = env.port {
            self.server.port = port;
        }
        if let Some(clear) = env.clear_delegation {
            self.revoke.clear_delegation = clear;
        }
        self.secrets = Secrets {
            hypersync_token: env.hypersync_token.filter(|t| !t.is_empty()),
            private_key: env.private_key.filter(|k| !k.is_empty()),
        };
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("scan.read_chunk_size must be >= 1".into()));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.key.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate chain key `{}`", chain.key)));
            }
            if chain.rpc_urls.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain `{}` has no rpc_urls",
                    chain.key
                )));
            }
        }
        Ok(())
    }

    /// Look up by key; `eth` is accepted for `mainnet` like the indexer does.
    pub fn chain(&self, key: &str) -> Option<&ChainConfig> {
        let key = if key == "eth" { "mainnet" } else { key };
        self.chains.iter().find(|c| c.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scan.min_allowance, 100);
        assert_eq!(config.scan.read_chunk_size, 50);
        assert_eq!(config.revoke.authorization_scheme, AuthorizationScheme::Eip712);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builtin_chain_table() {
        let config = AppConfig::default();
        assert_eq!(config.chains.len(), 12);
        assert_eq!(config.chain("base").map(|c| c.chain_id), Some(8453));
        assert_eq!(config.chain("eth").map(|c| c.chain_id), Some(1));
        assert!(config.chain("base-sepolia").and_then(|c| c.delegate).is_some());
        assert!(config.chain("nope").is_none());
        assert_eq!(
            config.chain("polygon").map(|c| c.hypersync_url.as_str()),
            Some("https://polygon.hypersync.xyz/query")
        );
    }

    #[test]
    fn test_file_overrides_merge_with_builtins() {
        let raw = r#"
            [scan]
            min_allowance = 1000
            read_chunk_size = 25

            [revoke]
            authorization_scheme = "eip7702"
            clear_delegation = true

            [[chains]]
            key = "base"
            name = "Base (private)"
            chain_id = 8453
            hypersync_url = "http://localhost:9000/api/hypersync?chain=base"
            rpc_urls = ["http://localhost:8545"]
            delegate = "0x430cae04bdfc596be0ca98b46279c3babf080620"
            delegate_supports_revoke_all = false

            [[chains]]
            key = "anvil"
            name = "Anvil"
            chain_id = 31337
            hypersync_url = "http://localhost:9001/query"
            rpc_urls = ["http://localhost:8546"]
        "#;
        let config = AppConfig::from_toml_str(raw).expect("parse");
        assert_eq!(config.scan.min_allowance, 1000);
        assert_eq!(config.scan.read_chunk_size, 25);
        // Untouched fields keep defaults
        assert_eq!(config.scan.metadata_ttl_secs, 3600);
        assert_eq!(config.revoke.authorization_scheme, AuthorizationScheme::Eip7702);
        assert!(config.revoke.clear_delegation);

        let base = config.chain("base").expect("base");
        assert_eq!(base.rpc_urls, vec!["http://localhost:8545".to_string()]);
        assert!(!base.delegate_supports_revoke_all);
        assert!(base.delegate.is_some());

        let anvil = config.chain("anvil").expect("anvil");
        assert!(anvil.scanning_supported);
        assert!(anvil.delegate.is_none());
        assert_eq!(config.chains.len(), 13);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig::from_file(dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.chains.len(), 12);
    }

    #[test]
    fn test_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[server]\nport = 9191").expect("write");
        let config = AppConfig::from_file(file.path()).expect("load");
        assert_eq!(config.server.port, 9191);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let result = AppConfig::from_toml_str("[scan]\nread_chunk_size = \"many\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = AppConfig::default();
        config.scan.read_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: EnvOverrides = envy::prefixed(ENV_PREFIX)
            .from_iter(vec![
                ("SWEEPER_HYPERSYNC_TOKEN".to_string(), "tok".to_string()),
                ("SWEEPER_PORT".to_string(), "7000".to_string()),
                ("SWEEPER_CLEAR_DELEGATION".to_string(), "true".to_string()),
            ])
            .expect("env");
        let mut config = AppConfig::default();
        config.apply_env(env);
        assert_eq!(config.server.port, 7000);
        assert!(config.revoke.clear_delegation);
        assert_eq!(config.secrets.hypersync_token.as_deref(), Some("tok"));
        assert!(config.secrets.private_key.is_none());
        assert!(!format!("{:?}", config.secrets).contains("tok"));
    }
}
