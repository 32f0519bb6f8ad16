//! In-memory store for development and tests

use super::{PaymentUpdate, StateStore};
use crate::error::RelayerResult;
use crate::payment::{PaymentIntent, PaymentStatus};
use crate::tx::{NonceKey, NonceReservation, SubmissionRecord};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A payment as the in-memory store sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayment {
    pub intent: PaymentIntent,
    pub status: PaymentStatus,
    pub tx_hash: Option<H256>,
    pub effective_fee: Option<U256>,
    pub failure_reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    payments: HashMap<Uuid, StoredPayment>,
    queue: VecDeque<Uuid>,
    submissions: HashMap<H256, SubmissionRecord>,
    reservations: BTreeSet<(String, ethers::types::Address, u64)>,
}

/// Non-durable `StateStore`
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an initiated intent to the claim queue
    pub async fn enqueue_intent(&self, intent: PaymentIntent) {
        let mut inner = self.inner.write().await;
        inner.queue.push_back(intent.id);
        inner.payments.insert(
            intent.id,
            StoredPayment {
                intent,
                status: PaymentStatus::Initiated,
                tx_hash: None,
                effective_fee: None,
                failure_reason: None,
            },
        );
    }

    pub async fn payment(&self, id: Uuid) -> Option<StoredPayment> {
        self.inner.read().await.payments.get(&id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn claim_intents(&self, limit: usize) -> RelayerResult<Vec<PaymentIntent>> {
        let mut inner = self.inner.write().await;
        let mut claimed = Vec::new();

        while claimed.len() < limit {
            let Some(id) = inner.queue.pop_front() else {
                break;
            };
            if let Some(payment) = inner.payments.get_mut(&id) {
                if payment.status == PaymentStatus::Initiated {
                    payment.status = PaymentStatus::Processing;
                    claimed.push(payment.intent.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn update_payment(&self, update: &PaymentUpdate) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        let mut requeue = false;
        if let Some(payment) = inner.payments.get_mut(&update.payment_id) {
            requeue = update.status == PaymentStatus::Initiated
                && payment.status != PaymentStatus::Initiated;
            payment.status = update.status;
            if update.tx_hash.is_some() {
                payment.tx_hash = update.tx_hash;
            }
            if update.effective_fee.is_some() {
                payment.effective_fee = update.effective_fee;
            }
            if update.reason.is_some() {
                payment.failure_reason = update.reason.clone();
            }
        }
        if requeue {
            inner.queue.push_back(update.payment_id);
        }
        Ok(())
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> RelayerResult<()> {
        self.inner
            .write()
            .await
            .submissions
            .insert(record.tx_hash, record.clone());
        Ok(())
    }

    async fn get_submission(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionRecord>> {
        Ok(self.inner.read().await.submissions.get(&tx_hash).cloned())
    }

    async fn open_submissions(&self) -> RelayerResult<Vec<SubmissionRecord>> {
        let inner = self.inner.read().await;
        let mut open: Vec<SubmissionRecord> = inner
            .submissions
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|r| r.submitted_at);
        Ok(open)
    }

    async fn save_reservation(&self, reservation: &NonceReservation) -> RelayerResult<()> {
        let key = reservation.key();
        self.inner.write().await.reservations.insert((
            key.network.clone(),
            key.account,
            reservation.nonce(),
        ));
        Ok(())
    }

    async fn clear_reservation(&self, key: &NonceKey, nonce: u64) -> RelayerResult<()> {
        self.inner
            .write()
            .await
            .reservations
            .remove(&(key.network.clone(), key.account, nonce));
        Ok(())
    }

    async fn reservations(&self) -> RelayerResult<Vec<(NonceKey, u64)>> {
        Ok(self
            .inner
            .read()
            .await
            .reservations
            .iter()
            .map(|(network, account, nonce)| (NonceKey::new(*account, network.clone()), *nonce))
            .collect())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
