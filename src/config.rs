//! Configuration management for the transfer relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::payment::Currency;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    /// Absent means an in-memory store (development only)
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub signer: SignerConfig,
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    /// Upper bound on payment intents claimed per poll
    pub max_concurrent_transfers: usize,
    /// A broadcast without receipt for this long is reported as stuck
    pub watch_window_secs: u64,
    pub signing_timeout_ms: u64,
    /// Reservations not broadcast within this window are released
    pub reservation_lease_secs: u64,
    #[serde(default = "default_replacement_bump")]
    pub replacement_bump_percent: u64,
    pub health_check_interval_secs: u64,
}

fn default_replacement_bump() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerConfig {
    /// External custody service
    Custody {
        base_url: String,
        api_token: String,
        #[serde(default = "default_signer_timeout")]
        request_timeout_ms: u64,
    },
    /// Local key from an environment variable, for development networks
    Local { private_key_env: String },
}

fn default_signer_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub fee_model: FeeModel,
    #[serde(default)]
    pub fee_strategy: FeeStrategy,
    #[serde(default = "default_gas_buffer")]
    pub gas_limit_buffer_percent: u64,
    /// Priority fee used when no history is consulted
    #[serde(default = "default_priority_fee")]
    pub priority_fee_gwei: u64,
    pub max_fee_per_gas_gwei: Option<u64>,
    /// Currency code -> token contract address
    pub tokens: HashMap<String, String>,
    pub enabled: bool,
}

fn default_gas_buffer() -> u64 {
    10
}

fn default_priority_fee() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeeModel {
    Legacy,
    Eip1559,
}

/// How fee rates are derived from network signals
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeeStrategy {
    /// One instantaneous gas price sample
    #[default]
    SingleSample,
    /// Median of a reward percentile over recent blocks
    Percentile { reward_percentile: f64, blocks: u64 },
    /// Percentile tip with a max fee that survives `max_wait_blocks` of base fee growth
    TargetLanding {
        reward_percentile: f64,
        blocks: u64,
        max_wait_blocks: u32,
    },
}

impl NetworkConfig {
    /// Parse the configured token table
    pub fn token_addresses(&self) -> Result<HashMap<Currency, Address>> {
        let mut tokens = HashMap::new();
        for (code, address) in &self.tokens {
            let parsed: Address = address
                .parse()
                .with_context(|| format!("Invalid token address for {}: {}", code, address))?;
            let currency = Currency::from(code.clone());
            tokens.insert(currency, parsed);
        }
        Ok(tokens)
    }
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a configuration document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_networks().is_empty() {
            anyhow::bail!("At least one network must be enabled");
        }

        for (name, network) in self.enabled_networks() {
            if network.rpc_urls.is_empty() {
                anyhow::bail!("Network {} has no RPC URLs configured", name);
            }
            if network.tokens.is_empty() {
                tracing::warn!("Network {} has no tokens configured - every transfer will be rejected", name);
            }
            network.token_addresses()?;

            match network.fee_strategy {
                FeeStrategy::SingleSample => {}
                FeeStrategy::Percentile {
                    reward_percentile,
                    blocks,
                }
                | FeeStrategy::TargetLanding {
                    reward_percentile,
                    blocks,
                    ..
                } => {
                    if !(0.0..=100.0).contains(&reward_percentile) {
                        anyhow::bail!(
                            "Network {} reward_percentile must be within 0..=100",
                            name
                        );
                    }
                    if blocks == 0 {
                        anyhow::bail!("Network {} fee history needs at least one block", name);
                    }
                }
            }
        }

        if self.relayer.watch_window_secs == 0 {
            anyhow::bail!("relayer.watch_window_secs must be positive");
        }

        Ok(())
    }

    /// Get list of enabled networks
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkConfig)> {
        self.networks.iter().filter(|(_, n)| n.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [relayer]
        instance_id = "relayer-1"
        poll_interval_ms = 2000
        max_concurrent_transfers = 16
        watch_window_secs = 180
        signing_timeout_ms = 15000
        reservation_lease_secs = 60
        health_check_interval_secs = 30

        [api]
        host = "127.0.0.1"
        port = 8080

        [metrics]
        enabled = false
        port = 9090

        [signer]
        kind = "local"
        private_key_env = "RELAYER_PRIVATE_KEY"

        [networks.base]
        chain_id = 8453
        rpc_urls = ["https://mainnet.base.org"]
        fee_model = "eip1559"
        enabled = true

        [networks.base.fee_strategy]
        kind = "target_landing"
        reward_percentile = 50.0
        blocks = 10
        max_wait_blocks = 3

        [networks.base.tokens]
        USDC = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_config() {
        let settings = Settings::parse(SAMPLE).unwrap();
        let base = &settings.networks["base"];
        assert_eq!(base.chain_id, 8453);
        assert_eq!(base.gas_limit_buffer_percent, 10);
        assert_eq!(settings.relayer.replacement_bump_percent, 10);
        assert!(settings.database.is_none());
        assert_eq!(
            base.fee_strategy,
            FeeStrategy::TargetLanding {
                reward_percentile: 50.0,
                blocks: 10,
                max_wait_blocks: 3
            }
        );

        let tokens = base.token_addresses().unwrap();
        assert!(tokens.contains_key(&Currency::Usdc));
        assert!(!tokens.contains_key(&Currency::Usdt));
    }

    #[test]
    fn test_invalid_token_address_rejected() {
        let broken = SAMPLE.replace(
            "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "0xnot-an-address",
        );
        assert!(Settings::parse(&broken).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.enabled_networks().len(), 1);
    }
}
