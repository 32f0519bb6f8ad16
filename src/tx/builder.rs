//! Transaction assembly from payment intents

use super::encoder::EncodedTransfer;
use super::gas::{FeeEstimate, FeeParams};
use crate::chain::{CallRequest, NetworkContext};
use crate::error::RelayerResult;
use crate::payment::PaymentIntent;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::AccessList;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A fully specified transaction awaiting signature
///
/// Never mutated after assembly; a fee or nonce change means a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub from: Address,
    /// Token contract
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fee: FeeParams,
}

impl UnsignedTransaction {
    pub fn to_typed(&self) -> TypedTransaction {
        match self.fee {
            FeeParams::Legacy { gas_price } => TransactionRequest::new()
                .from(self.from)
                .to(self.to)
                .value(self.value)
                .data(self.data.clone())
                .nonce(self.nonce)
                .gas(self.gas_limit)
                .gas_price(gas_price)
                .chain_id(self.chain_id)
                .into(),
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.from)
                .to(self.to)
                .value(self.value)
                .data(self.data.clone())
                .nonce(self.nonce)
                .gas(self.gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .access_list(AccessList::default())
                .chain_id(self.chain_id)
                .into(),
        }
    }

    /// Canonical unsigned encoding, the payload handed to the signer
    pub fn encoded(&self) -> Bytes {
        self.to_typed().rlp()
    }

    /// Digest the signature must cover
    pub fn sighash(&self) -> H256 {
        self.to_typed().sighash()
    }
}

/// Encoded and priced transfer, not yet bound to a nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransfer {
    pub from: Address,
    pub transfer: EncodedTransfer,
    pub estimate: FeeEstimate,
}

/// Builds unsigned transfers for one network
pub struct TransactionBuilder {
    network: Arc<NetworkContext>,
}

impl TransactionBuilder {
    pub fn new(network: Arc<NetworkContext>) -> Self {
        Self { network }
    }

    /// Encode the transfer, then simulate and price it
    ///
    /// Encoding failures are reported before any network call is made.
    pub async fn prepare(&self, intent: &PaymentIntent) -> RelayerResult<PreparedTransfer> {
        let transfer = self.network.encoder().encode(
            &intent.destination,
            intent.amount,
            &intent.currency,
        )?;

        let call = CallRequest {
            from: intent.source.wallet_address,
            to: transfer.contract,
            data: transfer.calldata.clone(),
        };
        let estimate = self
            .network
            .fee_estimator()
            .estimate(self.network.reader(), &call)
            .await?;

        Ok(PreparedTransfer {
            from: intent.source.wallet_address,
            transfer,
            estimate,
        })
    }

    /// Bind a prepared transfer to a nonce
    pub fn assemble(&self, prepared: &PreparedTransfer, nonce: u64) -> UnsignedTransaction {
        let unsigned = UnsignedTransaction {
            chain_id: self.network.chain_id(),
            from: prepared.from,
            to: prepared.transfer.contract,
            value: U256::zero(),
            data: prepared.transfer.calldata.clone(),
            nonce,
            gas_limit: prepared.estimate.gas_limit,
            fee: prepared.estimate.fee,
        };

        debug!(
            "Assembled transfer of {} to {:?} on {} (nonce {}, gas limit {})",
            prepared.transfer.amount,
            prepared.transfer.destination,
            self.network.name(),
            nonce,
            unsigned.gas_limit
        );

        unsigned
    }

    /// `prepare` then `assemble`, for a caller already holding a nonce
    pub async fn build(
        &self,
        intent: &PaymentIntent,
        nonce: u64,
    ) -> RelayerResult<UnsignedTransaction> {
        let prepared = self.prepare(intent).await?;
        Ok(self.assemble(&prepared, nonce))
    }
}
