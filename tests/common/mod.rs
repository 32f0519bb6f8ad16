//! Shared harness: an in-process fake network and a relayer wired to it

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use transfer_relayer::chain::{
    Broadcaster, CallRequest, ChainManager, FeeHistorySample, NetworkContext, NetworkReader,
    TxReceipt,
};
use transfer_relayer::config::{FeeModel, FeeStrategy, RelayerConfig};
use transfer_relayer::coordination::PaymentRelayer;
use transfer_relayer::error::{RelayerError, RelayerResult};
use transfer_relayer::payment::{Account, Currency, PaymentIntent};
use transfer_relayer::state::MemoryStore;
use transfer_relayer::tx::{FeeEstimator, LocalWalletSigner, TransferEncoder};
use uuid::Uuid;

/// Anvil's first development key
pub const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const NETWORK: &str = "base";
pub const GWEI: u64 = 1_000_000_000;

pub fn usdc() -> Address {
    Address::repeat_byte(0x0c)
}

/// Network that accepts everything and mines only what a test tells it to
pub struct FakeNetwork {
    pub pending_count: u64,
    pub confirmed_count: Mutex<u64>,
    pub gas_price: U256,
    pub revert: Mutex<Option<String>>,
    pub receipts: Mutex<HashMap<H256, TxReceipt>>,
    pub broadcasts: Mutex<Vec<Bytes>>,
    pub reads: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(pending_count: u64) -> Self {
        Self {
            pending_count,
            confirmed_count: Mutex::new(pending_count),
            gas_price: U256::from(30 * GWEI),
            revert: Mutex::new(None),
            receipts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Include `tx_hash` in a block, consuming its nonce
    pub fn mine(&self, tx_hash: H256, nonce: u64, success: bool) {
        self.receipts.lock().unwrap().insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                success,
                block_number: 100,
                gas_used: U256::from(45_000),
                effective_gas_price: Some(self.gas_price),
            },
        );
        let mut confirmed = self.confirmed_count.lock().unwrap();
        *confirmed = (*confirmed).max(nonce + 1);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkReader for FakeNetwork {
    async fn get_nonce_count(&self, _address: Address) -> RelayerResult<u64> {
        self.touch();
        Ok(self.pending_count)
    }

    async fn get_confirmed_nonce_count(&self, _address: Address) -> RelayerResult<u64> {
        self.touch();
        Ok(*self.confirmed_count.lock().unwrap())
    }

    async fn get_fee_sample(&self) -> RelayerResult<U256> {
        self.touch();
        Ok(self.gas_price)
    }

    async fn get_fee_history(
        &self,
        _blocks: u64,
        _reward_percentile: f64,
    ) -> RelayerResult<FeeHistorySample> {
        self.touch();
        Err(RelayerError::FeeEstimation("fee history unsupported".to_string()))
    }

    async fn simulate_gas(&self, _call: &CallRequest) -> RelayerResult<u64> {
        self.touch();
        match self.revert.lock().unwrap().clone() {
            Some(reason) => Err(RelayerError::GasSimulationFailed(reason)),
            None => Ok(50_000),
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>> {
        self.touch();
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }
}

#[async_trait]
impl Broadcaster for FakeNetwork {
    async fn submit(&self, raw: Bytes) -> RelayerResult<H256> {
        let hash = H256::from(keccak256(&raw));
        self.broadcasts.lock().unwrap().push(raw);
        Ok(hash)
    }
}

pub struct Harness {
    pub network: Arc<FakeNetwork>,
    pub store: Arc<MemoryStore>,
    pub relayer: Arc<PaymentRelayer>,
    pub wallet: Address,
}

impl Harness {
    pub fn new(pending_count: u64) -> Self {
        let network = Arc::new(FakeNetwork::new(pending_count));
        let store = Arc::new(MemoryStore::new());
        let signer = LocalWalletSigner::from_private_key(DEV_KEY).unwrap();
        let wallet = signer.address();

        let mut tokens = HashMap::new();
        tokens.insert(Currency::Usdc, usdc());
        let context = NetworkContext::new(
            NETWORK,
            8453,
            network.clone(),
            network.clone(),
            TransferEncoder::new(NETWORK, tokens),
            FeeEstimator::new(FeeModel::Legacy, FeeStrategy::SingleSample),
        );

        let relayer = PaymentRelayer::new(
            Arc::new(ChainManager::from_contexts(vec![context])),
            store.clone(),
            Arc::new(signer),
            config(),
            "test-proof",
        );

        Self {
            network,
            store,
            relayer: Arc::new(relayer),
            wallet,
        }
    }

    pub fn intent(&self, currency: Currency) -> PaymentIntent {
        let account = Account {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            wallet_address: self.wallet,
            sub_organization_id: "sub-org-1".to_string(),
        };
        PaymentIntent::new(
            account,
            "0x000000000000000000000000000000000000000b",
            1_000_000u64,
            currency,
            NETWORK,
        )
    }
}

pub fn config() -> RelayerConfig {
    RelayerConfig {
        instance_id: "integration".to_string(),
        poll_interval_ms: 50,
        max_concurrent_transfers: 8,
        watch_window_secs: 300,
        signing_timeout_ms: 5_000,
        reservation_lease_secs: 60,
        replacement_bump_percent: 10,
        health_check_interval_secs: 30,
    }
}
