//! Chain provider with multi-RPC support and automatic failover

use super::{Broadcaster, CallRequest, FeeHistorySample, NetworkReader, TxReceipt};
use crate::config::{FeeModel, NetworkConfig};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Network name used in logs and errors
    network: String,
    config: NetworkConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(network: String, config: NetworkConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for network {}: {}", network, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                network,
                message: "No valid RPC providers".to_string(),
            });
        }

        // The configured chain id is signed into every transaction, so a mismatch is fatal
        let reported = http_providers[0]
            .get_chainid()
            .await
            .map_err(|e| RelayerError::ChainConnection {
                network: network.clone(),
                message: e.to_string(),
            })?;
        if reported.as_u64() != config.chain_id {
            return Err(RelayerError::Config(format!(
                "Network {} reports chain id {}, configured {}",
                network, reported, config.chain_id
            )));
        }

        Ok(Self {
            network,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Network {} failover to provider {}", self.network, next);
    }

    fn connection_error(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::ChainConnection {
            network: self.network.clone(),
            message: message.into(),
        }
    }

    /// Transaction count at a block tag, retried across providers
    async fn transaction_count(&self, address: Address, tag: BlockNumber) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(tag.into()))
                .await
            {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count from network {}: {}",
                        self.network, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get transaction count"))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.http().get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for network {}: {}", self.network, e);
                self.failover();
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[async_trait]
impl NetworkReader for ChainProvider {
    async fn get_nonce_count(&self, address: Address) -> RelayerResult<u64> {
        self.transaction_count(address, BlockNumber::Pending).await
    }

    async fn get_confirmed_nonce_count(&self, address: Address) -> RelayerResult<u64> {
        self.transaction_count(address, BlockNumber::Latest).await
    }

    async fn get_fee_sample(&self) -> RelayerResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| RelayerError::FeeEstimation(e.to_string()))
    }

    async fn get_fee_history(
        &self,
        blocks: u64,
        reward_percentile: f64,
    ) -> RelayerResult<FeeHistorySample> {
        let history = self
            .http()
            .fee_history(blocks, BlockNumber::Latest, &[reward_percentile])
            .await
            .map_err(|e| RelayerError::FeeEstimation(e.to_string()))?;

        Ok(FeeHistorySample {
            base_fee_per_gas: history.base_fee_per_gas,
            rewards: history
                .reward
                .iter()
                .filter_map(|r| r.first().copied())
                .collect(),
        })
    }

    async fn simulate_gas(&self, call: &CallRequest) -> RelayerResult<u64> {
        let tx: TypedTransaction = match self.config.fee_model {
            FeeModel::Legacy => TransactionRequest::new()
                .from(call.from)
                .to(call.to)
                .data(call.data.clone())
                .into(),
            FeeModel::Eip1559 => Eip1559TransactionRequest::new()
                .from(call.from)
                .to(call.to)
                .data(call.data.clone())
                .into(),
        };

        match self.http().estimate_gas(&tx, None).await {
            Ok(gas) => Ok(gas.as_u64()),
            Err(e) => {
                let message = e.to_string();
                if is_revert(&message) {
                    Err(RelayerError::GasSimulationFailed(message))
                } else {
                    self.failover();
                    Err(self.connection_error(message))
                }
            }
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        Ok(receipt.and_then(|r| {
            // A receipt without a block is not mined yet
            let block_number = r.block_number?.as_u64();
            Some(TxReceipt {
                tx_hash: r.transaction_hash,
                success: r.status == Some(1.into()),
                block_number,
                gas_used: r.gas_used.unwrap_or_default(),
                effective_gas_price: r.effective_gas_price,
            })
        }))
    }
}

#[async_trait]
impl Broadcaster for ChainProvider {
    async fn submit(&self, raw: Bytes) -> RelayerResult<H256> {
        let local_hash = H256::from(ethers::utils::keccak256(&raw));
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                // Another provider already accepted this exact payload
                if is_already_known(&message) {
                    debug!("Network {} already knows {:?}", self.network, local_hash);
                    return Ok(local_hash);
                }
                Err(classify_submit_error(&self.network, message))
            }
        }
    }
}

/// The node already holds this exact payload in its pool
fn is_already_known(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["already known", "known transaction", "already imported"]
        .iter()
        .any(|m| message.contains(m))
}

fn is_revert(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("execution reverted")
        || message.contains("revert")
        || message.contains("gas required exceeds allowance")
        || message.contains("insufficient funds")
}

/// Map a node's broadcast error onto the relayer taxonomy.
///
/// Only the listed pool-admission failures are definitive rejections. Any other
/// error, coded or not, leaves the broadcast outcome unknown.
pub fn classify_submit_error(network: &str, message: String) -> RelayerError {
    let lower = message.to_ascii_lowercase();
    let rejected = [
        "replacement transaction underpriced",
        "insufficient funds",
        "intrinsic gas too low",
        "exceeds block gas limit",
        "fee cap less than block base fee",
        "max fee per gas less than block base fee",
        "transaction underpriced",
        "invalid sender",
    ];

    if lower.contains("nonce too low") {
        RelayerError::NonceTooLow {
            network: network.to_string(),
        }
    } else if rejected.iter().any(|r| lower.contains(r)) {
        RelayerError::SubmissionRejected {
            network: network.to_string(),
            reason: message,
        }
    } else {
        RelayerError::ChainConnection {
            network: network.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nonce_too_low() {
        let err = classify_submit_error("base", "(code: -32000, message: nonce too low, data: None)".into());
        assert!(matches!(err, RelayerError::NonceTooLow { .. }));
    }

    #[test]
    fn test_classify_definitive_rejection() {
        let err = classify_submit_error(
            "base",
            "(code: -32000, message: insufficient funds for gas * price + value, data: None)".into(),
        );
        assert!(matches!(err, RelayerError::SubmissionRejected { .. }));
    }

    #[test]
    fn test_classify_transport_error_is_ambiguous() {
        let err = classify_submit_error("base", "error sending request: connection reset".into());
        assert!(matches!(err, RelayerError::ChainConnection { .. }));
    }

    #[test]
    fn test_revert_detection() {
        assert!(is_revert("(code: 3, message: execution reverted: ERC20: transfer amount exceeds balance)"));
        assert!(!is_revert("error sending request for url"));
    }

    #[test]
    fn test_coded_errors_outside_the_list_are_ambiguous() {
        for message in [
            "(code: -32603, message: internal error, data: None)",
            "(code: -32005, message: request rate limited, data: None)",
            "(code: -32000, message: header not found, data: None)",
        ] {
            let err = classify_submit_error("base", message.into());
            assert!(
                matches!(err, RelayerError::ChainConnection { .. }),
                "{} classified as {:?}",
                message,
                err
            );
        }
    }

    #[test]
    fn test_already_known_variants() {
        assert!(is_already_known("(code: -32000, message: already known, data: None)"));
        assert!(is_already_known("(code: -32010, message: Known transaction: 0xab, data: None)"));
        assert!(is_already_known("(code: -32010, message: Transaction with the same hash was already imported., data: None)"));
        assert!(!is_already_known("(code: -32000, message: nonce too low, data: None)"));
    }
}
