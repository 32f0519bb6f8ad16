//! State persistence
//!
//! Handles:
//! - Claiming initiated payment intents
//! - Payment status feedback
//! - Submission records for restart recovery
//! - Durable nonce reservations

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::{MemoryStore, StoredPayment};

use crate::error::RelayerResult;
use crate::payment::{PaymentIntent, PaymentStatus};
use crate::tx::{NonceKey, NonceReservation, SubmissionRecord};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use uuid::Uuid;

/// Status written back to a payment record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub tx_hash: Option<H256>,
    pub effective_fee: Option<U256>,
    pub reason: Option<String>,
}

impl PaymentUpdate {
    pub fn new(payment_id: Uuid, status: PaymentStatus) -> Self {
        Self {
            payment_id,
            status,
            tx_hash: None,
            effective_fee: None,
            reason: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: H256) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_effective_fee(mut self, fee: Option<U256>) -> Self {
        self.effective_fee = fee;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Persistence facility
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Move up to `limit` initiated intents to processing and return them
    async fn claim_intents(&self, limit: usize) -> RelayerResult<Vec<PaymentIntent>>;

    async fn update_payment(&self, update: &PaymentUpdate) -> RelayerResult<()>;

    /// Insert or update by transaction hash
    async fn save_submission(&self, record: &SubmissionRecord) -> RelayerResult<()>;

    async fn get_submission(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionRecord>>;

    /// Records not yet Confirmed, Failed or Replaced
    async fn open_submissions(&self) -> RelayerResult<Vec<SubmissionRecord>>;

    async fn save_reservation(&self, reservation: &NonceReservation) -> RelayerResult<()>;

    async fn clear_reservation(&self, key: &NonceKey, nonce: u64) -> RelayerResult<()>;

    /// Reservations recorded but never broadcast
    async fn reservations(&self) -> RelayerResult<Vec<(NonceKey, u64)>>;

    async fn health_check(&self) -> RelayerResult<()>;
}
