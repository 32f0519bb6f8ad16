//! Gas limit and fee estimation for unconfirmed transactions

use crate::chain::{CallRequest, FeeHistorySample, NetworkReader};
use crate::config::{FeeModel, FeeStrategy, NetworkConfig};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;

/// Fee fields of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeParams {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeParams {
    /// Highest price per gas the sender may pay
    pub fn max_price(&self) -> U256 {
        match self {
            FeeParams::Legacy { gas_price } => *gas_price,
            FeeParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Scale every component by `100 + percent` / 100, rounding up
    pub fn bumped(&self, percent: u64) -> FeeParams {
        let bump = |v: U256| (v * (100 + percent) + 99u64) / 100u64;
        match self {
            FeeParams::Legacy { gas_price } => FeeParams::Legacy {
                gas_price: bump(*gas_price),
            },
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeParams::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas),
            },
        }
    }

    /// Component-wise maximum of two fee settings of the same model
    pub fn at_least(&self, floor: &FeeParams) -> FeeParams {
        match (self, floor) {
            (FeeParams::Legacy { gas_price }, FeeParams::Legacy { gas_price: min }) => {
                FeeParams::Legacy {
                    gas_price: (*gas_price).max(*min),
                }
            }
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeeParams::Eip1559 {
                    max_fee_per_gas: min_fee,
                    max_priority_fee_per_gas: min_priority,
                },
            ) => FeeParams::Eip1559 {
                max_fee_per_gas: (*max_fee_per_gas).max(*min_fee),
                max_priority_fee_per_gas: (*max_priority_fee_per_gas).max(*min_priority),
            },
            // Mixed models cannot replace each other on the same network
            _ => *self,
        }
    }

    /// Worst-case cost in wei for a gas limit
    pub fn max_cost(&self, gas_limit: u64) -> U256 {
        self.max_price() * U256::from(gas_limit)
    }
}

/// Result of simulating a call and pricing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub fee: FeeParams,
    pub gas_limit: u64,
    pub simulated_gas: u64,
}

/// Fee estimator for one network
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    model: FeeModel,
    strategy: FeeStrategy,
    /// Buffer percentage for gas limit (e.g., 10 = 10% buffer)
    gas_limit_buffer_percent: u64,
    /// Tip used when no fee history is consulted
    default_priority_fee: U256,
    max_fee_per_gas: Option<U256>,
}

impl FeeEstimator {
    /// Create a fee estimator with the given model and strategy
    pub fn new(model: FeeModel, strategy: FeeStrategy) -> Self {
        Self {
            model,
            strategy,
            gas_limit_buffer_percent: 10,
            default_priority_fee: U256::from(GWEI),
            max_fee_per_gas: None,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            model: config.fee_model,
            strategy: config.fee_strategy.clone(),
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            default_priority_fee: U256::from(config.priority_fee_gwei) * U256::from(GWEI),
            max_fee_per_gas: config
                .max_fee_per_gas_gwei
                .map(|g| U256::from(g) * U256::from(GWEI)),
        }
    }

    pub fn with_max_fee_per_gas(mut self, cap: U256) -> Self {
        self.max_fee_per_gas = Some(cap);
        self
    }

    pub fn model(&self) -> FeeModel {
        self.model
    }

    /// Simulate the call, then price it
    ///
    /// A failed simulation is returned as-is: the transfer would most likely
    /// revert on-chain too, so there is no fallback gas limit.
    pub async fn estimate(
        &self,
        reader: &dyn NetworkReader,
        call: &CallRequest,
    ) -> RelayerResult<FeeEstimate> {
        let simulated_gas = reader.simulate_gas(call).await?;
        let gas_limit = self.gas_limit(simulated_gas);
        let fee = self.fee_params(reader).await?;

        debug!(
            simulated_gas,
            gas_limit,
            max_price = %fee.max_price(),
            "Estimated fees for call to {:?}",
            call.to
        );

        Ok(FeeEstimate {
            fee,
            gas_limit,
            simulated_gas,
        })
    }

    /// Simulated gas plus the safety buffer, integer floor
    pub fn gas_limit(&self, simulated_gas: u64) -> u64 {
        let buffered =
            simulated_gas as u128 * (100 + self.gas_limit_buffer_percent) as u128 / 100;
        buffered.min(u64::MAX as u128) as u64
    }

    /// Current fee parameters per the configured strategy
    pub async fn fee_params(&self, reader: &dyn NetworkReader) -> RelayerResult<FeeParams> {
        let fee = match &self.strategy {
            FeeStrategy::SingleSample => {
                let rate = reader.get_fee_sample().await?;
                self.price_sample(rate)
            }
            FeeStrategy::Percentile {
                reward_percentile,
                blocks,
            } => {
                let history = reader.get_fee_history(*blocks, *reward_percentile).await?;
                self.price_history(&history, None)?
            }
            FeeStrategy::TargetLanding {
                reward_percentile,
                blocks,
                max_wait_blocks,
            } => {
                let history = reader.get_fee_history(*blocks, *reward_percentile).await?;
                self.price_history(&history, Some(*max_wait_blocks))?
            }
        };

        Ok(self.apply_cap(fee))
    }

    /// Single instantaneous sample, no smoothing
    fn price_sample(&self, rate: U256) -> FeeParams {
        match self.model {
            FeeModel::Legacy => FeeParams::Legacy { gas_price: rate },
            FeeModel::Eip1559 => FeeParams::Eip1559 {
                max_fee_per_gas: rate,
                max_priority_fee_per_gas: self.default_priority_fee.min(rate),
            },
        }
    }

    fn price_history(
        &self,
        history: &FeeHistorySample,
        max_wait_blocks: Option<u32>,
    ) -> RelayerResult<FeeParams> {
        let next_base_fee = *history.base_fee_per_gas.last().ok_or_else(|| {
            RelayerError::FeeEstimation("fee history returned no base fee".to_string())
        })?;
        let priority_fee = median(&history.rewards).unwrap_or(self.default_priority_fee);

        let base_fee_ceiling = match max_wait_blocks {
            // Max fee = 2 * base_fee (buffer for block variability)
            None => next_base_fee * 2u64,
            Some(blocks) => worst_case_base_fee(next_base_fee, blocks),
        };

        Ok(match self.model {
            FeeModel::Legacy => FeeParams::Legacy {
                gas_price: base_fee_ceiling + priority_fee,
            },
            FeeModel::Eip1559 => FeeParams::Eip1559 {
                max_fee_per_gas: base_fee_ceiling + priority_fee,
                max_priority_fee_per_gas: priority_fee,
            },
        })
    }

    fn apply_cap(&self, fee: FeeParams) -> FeeParams {
        let Some(cap) = self.max_fee_per_gas else {
            return fee;
        };
        if fee.max_price() <= cap {
            return fee;
        }

        warn!(
            "Estimated fee {} exceeds cap {}, capping (inclusion may be delayed)",
            fee.max_price(),
            cap
        );
        match fee {
            FeeParams::Legacy { .. } => FeeParams::Legacy { gas_price: cap },
            FeeParams::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => FeeParams::Eip1559 {
                max_fee_per_gas: cap,
                max_priority_fee_per_gas: max_priority_fee_per_gas.min(cap),
            },
        }
    }
}

/// Base fee after `blocks` consecutive full blocks (+12.5% each), rounded up
fn worst_case_base_fee(base_fee: U256, blocks: u32) -> U256 {
    (0..blocks).fold(base_fee, |fee, _| (fee * 1125u64 + 999u64) / 1000u64)
}

fn median(values: &[U256]) -> Option<U256> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[(sorted.len() - 1) / 2])
}
