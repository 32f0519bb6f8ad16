//! Chain module - contracts against the network read and broadcast facilities
//!
//! This module provides:
//! - `NetworkReader` / `Broadcaster` capability traits the core depends on
//! - An ethers-backed provider with multi-RPC failover
//! - Per-network context (encoder, fee estimator, chain id) keyed by network name

pub mod provider;

pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{FeeEstimator, TransferEncoder};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Read-only call used for gas simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub success: bool,
    pub block_number: u64,
    pub gas_used: U256,
    /// Absent on nodes that predate the field
    pub effective_gas_price: Option<U256>,
}

impl TxReceipt {
    /// Fee actually paid, when the node reports enough to compute it
    pub fn effective_fee(&self) -> Option<U256> {
        self.effective_gas_price.map(|price| self.gas_used * price)
    }
}

/// Recent fee market history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeHistorySample {
    /// Base fee per block; the last entry is the pending block's base fee
    pub base_fee_per_gas: Vec<U256>,
    /// Requested reward percentile, one entry per block
    pub rewards: Vec<U256>,
}

/// Network-read facility
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkReader: Send + Sync {
    /// Transactions the network considers included or pending for `address`
    async fn get_nonce_count(&self, address: Address) -> RelayerResult<u64>;

    /// Transactions included in the latest block for `address`
    async fn get_confirmed_nonce_count(&self, address: Address) -> RelayerResult<u64>;

    /// One instantaneous fee-rate sample
    async fn get_fee_sample(&self) -> RelayerResult<U256>;

    async fn get_fee_history(
        &self,
        blocks: u64,
        reward_percentile: f64,
    ) -> RelayerResult<FeeHistorySample>;

    /// Executes the call against pending state; a revert is `GasSimulationFailed`
    async fn simulate_gas(&self, call: &CallRequest) -> RelayerResult<u64>;

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>>;
}

/// Network-broadcast facility
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn submit(&self, raw: Bytes) -> RelayerResult<H256>;
}

/// Everything needed to build and track transfers on one network
pub struct NetworkContext {
    name: String,
    chain_id: u64,
    reader: Arc<dyn NetworkReader>,
    broadcaster: Arc<dyn Broadcaster>,
    encoder: TransferEncoder,
    fee_estimator: FeeEstimator,
}

impl NetworkContext {
    pub fn new(
        name: impl Into<String>,
        chain_id: u64,
        reader: Arc<dyn NetworkReader>,
        broadcaster: Arc<dyn Broadcaster>,
        encoder: TransferEncoder,
        fee_estimator: FeeEstimator,
    ) -> Self {
        Self {
            name: name.into(),
            chain_id,
            reader,
            broadcaster,
            encoder,
            fee_estimator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn reader(&self) -> &dyn NetworkReader {
        self.reader.as_ref()
    }

    pub fn broadcaster(&self) -> &dyn Broadcaster {
        self.broadcaster.as_ref()
    }

    pub fn encoder(&self) -> &TransferEncoder {
        &self.encoder
    }

    pub fn fee_estimator(&self) -> &FeeEstimator {
        &self.fee_estimator
    }
}

/// Manages connections to all configured networks
pub struct ChainManager {
    networks: HashMap<String, Arc<NetworkContext>>,
    providers: HashMap<String, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Connect to every enabled network
    pub async fn new(settings: &Settings) -> RelayerResult<Self> {
        let mut networks = HashMap::new();
        let mut providers = HashMap::new();

        for (name, network_config) in settings.enabled_networks() {
            info!(
                "Initializing network {} (chain ID: {})",
                name, network_config.chain_id
            );

            let tokens = network_config
                .token_addresses()
                .map_err(|e| RelayerError::Config(e.to_string()))?;

            let provider = Arc::new(ChainProvider::new(name.clone(), network_config.clone()).await?);
            let context = NetworkContext::new(
                name.clone(),
                network_config.chain_id,
                provider.clone(),
                provider.clone(),
                TransferEncoder::new(name.clone(), tokens),
                FeeEstimator::from_config(network_config),
            );

            networks.insert(name.clone(), Arc::new(context));
            providers.insert(name.clone(), provider);
            info!("Network {} initialized successfully", name);
        }

        Ok(Self {
            networks,
            providers,
        })
    }

    /// Build a manager from pre-assembled contexts
    pub fn from_contexts(contexts: Vec<NetworkContext>) -> Self {
        let networks = contexts
            .into_iter()
            .map(|c| (c.name().to_string(), Arc::new(c)))
            .collect();
        Self {
            networks,
            providers: HashMap::new(),
        }
    }

    /// Get context for a network
    pub fn get(&self, network: &str) -> RelayerResult<Arc<NetworkContext>> {
        self.networks
            .get(network)
            .cloned()
            .ok_or_else(|| RelayerError::UnsupportedNetwork(network.to_string()))
    }

    /// Health check for all RPC-backed networks
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();

        for (name, provider) in &self.providers {
            let healthy = provider.health_check().await;
            if !healthy {
                warn!("Network {} health check failed", name);
            }
            results.push((name.clone(), healthy));

            crate::metrics::record_network_health(name, healthy);
        }

        results
    }

    /// Get all configured network names
    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.keys().cloned().collect();
        names.sort();
        names
    }
}
