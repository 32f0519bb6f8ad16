//! Payment relayer: drives intents through build, sign, submit and tracking

use crate::chain::{ChainManager, NetworkContext};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::payment::{PaymentIntent, PaymentStatus};
use crate::state::{PaymentUpdate, StateStore};
use crate::tx::{
    NonceAllocator, NonceKey, NonceReservation, NonceSnapshot, SignerCredentials,
    SigningGateway, StatusChange, SubmissionRecord, SubmissionTracker, SubmitOutcome,
    TransactionBuilder, TransferState, UnsignedTransaction,
};

use chrono::Utc;
use ethers::types::H256;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

/// Terminal records are kept in memory this long for status queries
const RECORD_RETENTION_SECS: i64 = 3600;

/// Entry point of the on-chain leg
pub struct PaymentRelayer {
    chains: Arc<ChainManager>,
    store: Arc<dyn StateStore>,
    signer: Arc<dyn SigningGateway>,
    allocator: NonceAllocator,
    tracker: SubmissionTracker,
    config: RelayerConfig,
    /// Proof presented to the custody service with every signing request
    authentication_proof: String,
    shutdown: Arc<RwLock<bool>>,
}

impl PaymentRelayer {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<dyn StateStore>,
        signer: Arc<dyn SigningGateway>,
        config: RelayerConfig,
        authentication_proof: impl Into<String>,
    ) -> Self {
        Self {
            allocator: NonceAllocator::new(store.clone()),
            tracker: SubmissionTracker::new(Duration::from_secs(config.watch_window_secs)),
            chains,
            store,
            signer,
            config,
            authentication_proof: authentication_proof.into(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn chains(&self) -> &ChainManager {
        &self.chains
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub async fn nonce_snapshot(&self, key: &NonceKey) -> Option<NonceSnapshot> {
        self.allocator.snapshot(key).await
    }

    /// Tracked record, falling back to the store for pruned ones
    pub async fn submission(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionRecord>> {
        match self.tracker.get(&tx_hash) {
            Some(record) => Ok(Some(record)),
            None => self.store.get_submission(tx_hash).await,
        }
    }

    /// Build, sign and submit a transfer for `intent`
    ///
    /// Returns the transaction hash once the network accepted the payload, or
    /// when the broadcast outcome is unknown and the attempt is being tracked.
    pub async fn build_and_submit(&self, intent: &PaymentIntent) -> RelayerResult<H256> {
        let started = Instant::now();
        let result = self.try_build_and_submit(intent).await;

        match &result {
            Ok(_) => crate::metrics::record_build_latency(
                &intent.network,
                started.elapsed().as_secs_f64(),
            ),
            Err(e) => crate::metrics::record_build_failure(&intent.network, e.kind().as_str()),
        }
        result
    }

    async fn try_build_and_submit(&self, intent: &PaymentIntent) -> RelayerResult<H256> {
        let network = self.chains.get(&intent.network)?;
        let builder = TransactionBuilder::new(network.clone());

        // Encoding and estimation need no nonce and run unserialized
        let prepared = builder.prepare(intent).await?;

        let key = NonceKey::new(intent.source.wallet_address, intent.network.clone());
        let reservation = self.allocator.reserve(&key, network.reader()).await?;
        let unsigned = builder.assemble(&prepared, reservation.nonce());

        self.sign_and_submit(&network, intent, unsigned, reservation)
            .await
    }

    /// Caller-driven retry of an in-flight transfer under the same nonce
    pub async fn replace(&self, original_hash: H256, intent: &PaymentIntent) -> RelayerResult<H256> {
        let original = self
            .tracker
            .get(&original_hash)
            .filter(|r| r.payment_id == intent.id)
            .ok_or_else(|| RelayerError::SubmissionNotFound {
                tx_hash: format!("{:?}", original_hash),
            })?;

        if original.state.is_terminal() {
            return Err(RelayerError::InvalidStateTransition {
                from: original.state.to_string(),
                to: TransferState::Replaced.to_string(),
            });
        }

        let network = self.chains.get(&original.network)?;
        let builder = TransactionBuilder::new(network.clone());
        let mut prepared = builder.prepare(intent).await?;

        let floor = original.fee.bumped(self.config.replacement_bump_percent);
        prepared.estimate.fee = prepared.estimate.fee.at_least(&floor);

        let reservation = self
            .allocator
            .reserve_in_flight(&original.key(), original.nonce)
            .await?;
        let unsigned = builder.assemble(&prepared, original.nonce);

        info!(
            "Replacing {:?} (nonce {}) with max fee {}",
            original_hash,
            original.nonce,
            unsigned.fee.max_price()
        );

        self.sign_and_submit(&network, intent, unsigned, reservation)
            .await
    }

    async fn sign_and_submit(
        &self,
        network: &NetworkContext,
        intent: &PaymentIntent,
        unsigned: UnsignedTransaction,
        reservation: NonceReservation,
    ) -> RelayerResult<H256> {
        let credentials = SignerCredentials::for_account(&intent.source, &self.authentication_proof);
        let signing_timeout = Duration::from_millis(self.config.signing_timeout_ms);

        let signed = match timeout(signing_timeout, self.signer.sign(&unsigned, &credentials)).await {
            Ok(Ok(signed)) => signed,
            Ok(Err(e)) => {
                warn!("Signing failed for payment {}: {}", intent.id, e);
                self.release(reservation).await;
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Signing timed out after {:?} for payment {}",
                    signing_timeout, intent.id
                );
                self.release(reservation).await;
                return Err(RelayerError::Timeout {
                    operation: "signing".to_string(),
                });
            }
        };

        let tx_hash = signed.hash();
        let key = reservation.key().clone();
        let nonce = reservation.nonce();
        let replacement = reservation.is_replacement();

        // Fails when the lease expired during signing; nothing was broadcast
        self.allocator.mark_broadcast(&reservation, tx_hash).await?;

        let record = SubmissionRecord::new(&signed, intent.id, network.name());
        if let Err(e) = self.store.save_submission(&record).await {
            error!("Failed to persist {:?} before broadcast: {}", tx_hash, e);
            self.allocator.rollback_broadcast(&key, nonce, tx_hash).await;
            return Err(e);
        }
        self.tracker.register(record);

        match self.tracker.submit(&signed, network.broadcaster()).await {
            SubmitOutcome::Accepted(hash) => {
                info!(
                    "Submitted {:?} for payment {} on {} (nonce {})",
                    hash,
                    intent.id,
                    network.name(),
                    nonce
                );
                crate::metrics::record_submission(network.name(), "accepted");
                self.broadcast_done(intent, tx_hash).await?;
                Ok(tx_hash)
            }
            SubmitOutcome::Ambiguous(reason) => {
                warn!(
                    "Broadcast of {:?} has unknown outcome, tracking it: {}",
                    tx_hash, reason
                );
                crate::metrics::record_submission(network.name(), "ambiguous");
                self.broadcast_done(intent, tx_hash).await?;
                Ok(tx_hash)
            }
            SubmitOutcome::Rejected(reason) => {
                warn!("Network {} rejected {:?}: {}", network.name(), tx_hash, reason);
                crate::metrics::record_submission(network.name(), "rejected");
                let change = self.tracker.reject(tx_hash, &reason)?;
                self.allocator.rollback_broadcast(&key, nonce, tx_hash).await;
                self.persist(&change).await;
                Err(RelayerError::SubmissionRejected {
                    network: network.name().to_string(),
                    reason,
                })
            }
            SubmitOutcome::NonceConsumed => {
                warn!(
                    "Nonce {} for {} already consumed, resyncing",
                    nonce, key
                );
                crate::metrics::record_submission(network.name(), "nonce_consumed");
                let change = self.tracker.reject(tx_hash, "nonce already consumed")?;
                self.allocator.rollback_broadcast(&key, nonce, tx_hash).await;
                self.persist(&change).await;
                if !replacement {
                    self.allocator.resync(&key, network.reader()).await?;
                }
                Err(RelayerError::NonceTooLow {
                    network: network.name().to_string(),
                })
            }
        }
    }

    async fn broadcast_done(&self, intent: &PaymentIntent, tx_hash: H256) -> RelayerResult<()> {
        let changes = self.tracker.broadcast(tx_hash)?;
        let late = changes.iter().any(|c| c.to == TransferState::Replaced);

        for change in &changes {
            if change.to == TransferState::Broadcast {
                self.persist(change).await;
            } else {
                self.apply_change(change).await;
            }
        }

        // A late attempt must not overwrite the outcome its slot already reported
        if !late {
            self.feedback(
                PaymentUpdate::new(intent.id, PaymentStatus::Submitted).with_tx_hash(tx_hash),
            )
            .await;
        }
        Ok(())
    }

    async fn release(&self, reservation: NonceReservation) {
        let key = reservation.key().clone();
        let nonce = reservation.nonce();
        if let Err(e) = self.allocator.release(reservation).await {
            error!("Failed to release nonce {} for {}: {}", nonce, key, e);
        }
    }

    async fn persist(&self, change: &StatusChange) {
        crate::metrics::record_transition(&change.key.network, change.to);
        if let Some(record) = self.tracker.get(&change.tx_hash) {
            if let Err(e) = self.store.save_submission(&record).await {
                error!("Failed to persist {:?} as {}: {}", change.tx_hash, change.to, e);
            }
        }
    }

    async fn feedback(&self, update: PaymentUpdate) {
        debug!("Payment {} -> {}", update.payment_id, update.status.as_str());
        if let Err(e) = self.store.update_payment(&update).await {
            error!("Failed to update payment {}: {}", update.payment_id, e);
        }
    }

    /// Drive every open nonce slot one step and feed outcomes back
    pub async fn poll_submissions(&self) -> RelayerResult<usize> {
        let mut applied = 0;

        for (key, nonce) in self.tracker.open_slots() {
            let network = match self.chains.get(&key.network) {
                Ok(network) => network,
                Err(e) => {
                    warn!("Cannot poll nonce {} for {}: {}", nonce, key, e);
                    continue;
                }
            };

            let poll = match self
                .tracker
                .poll_slot(&key, nonce, network.reader(), Utc::now())
                .await
            {
                Ok(poll) => poll,
                Err(e) => {
                    warn!("Polling nonce {} for {} failed: {}", nonce, key, e);
                    continue;
                }
            };

            if poll.consumed {
                self.allocator.settle(&key, nonce).await;
            }

            for change in &poll.changes {
                self.apply_change(change).await;
                applied += 1;
            }
        }

        Ok(applied)
    }

    async fn apply_change(&self, change: &StatusChange) {
        self.persist(change).await;
        let record = self.tracker.get(&change.tx_hash);

        let base = PaymentUpdate::new(change.payment_id, PaymentStatus::Failed)
            .with_tx_hash(change.tx_hash);
        let update = match change.to {
            TransferState::Stuck => Some(PaymentUpdate {
                status: PaymentStatus::Stuck,
                ..base
            }),
            TransferState::Confirmed => {
                let fee = record.as_ref().and_then(|r| r.effective_fee);
                if let Some(fee) = fee {
                    crate::metrics::record_fee_paid(&change.key.network, fee);
                }
                Some(
                    PaymentUpdate {
                        status: PaymentStatus::Confirmed,
                        ..base
                    }
                    .with_effective_fee(fee),
                )
            }
            TransferState::Failed => {
                let reason = record
                    .and_then(|r| r.failure_reason)
                    .unwrap_or_else(|| "transaction failed".to_string());
                Some(base.with_reason(reason))
            }
            // A sibling took the slot; its own change reports the outcome
            TransferState::Replaced if change.replaced_by.is_some() => None,
            TransferState::Replaced => {
                Some(base.with_reason("nonce consumed by a transaction this relayer did not send"))
            }
            _ => None,
        };

        if let Some(update) = update {
            self.feedback(update).await;
        }
    }

    /// Claim initiated intents and run each transfer as its own task
    pub async fn process_intents(self: &Arc<Self>) -> RelayerResult<usize> {
        let intents = self
            .store
            .claim_intents(self.config.max_concurrent_transfers)
            .await?;
        let claimed = intents.len();

        let tasks: Vec<_> = intents
            .into_iter()
            .map(|intent| {
                let relayer = self.clone();
                tokio::spawn(async move { relayer.handle_intent(intent).await })
            })
            .collect();

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!("Transfer task aborted: {}", e);
            }
        }

        Ok(claimed)
    }

    async fn handle_intent(&self, intent: PaymentIntent) {
        match self.build_and_submit(&intent).await {
            Ok(tx_hash) => debug!("Payment {} in flight as {:?}", intent.id, tx_hash),
            Err(e) if e.is_retryable() => {
                warn!("Payment {} will be retried: {}", intent.id, e);
                self.feedback(
                    PaymentUpdate::new(intent.id, PaymentStatus::Initiated).with_reason(e.to_string()),
                )
                .await;
            }
            Err(e) => {
                if e.should_alert() {
                    error!("Payment {} failed: {}", intent.id, e);
                } else {
                    warn!("Payment {} failed: {}", intent.id, e);
                }
                self.feedback(
                    PaymentUpdate::new(intent.id, PaymentStatus::Failed).with_reason(e.to_string()),
                )
                .await;
            }
        }
    }

    /// Reload open submissions after a restart
    pub async fn recover(&self) -> RelayerResult<usize> {
        // Reservations without a submission record were never broadcast
        for (key, nonce) in self.store.reservations().await? {
            info!("Dropping unbroadcast reservation of nonce {} for {}", nonce, key);
            self.store.clear_reservation(&key, nonce).await?;
        }

        let open = self.store.open_submissions().await?;
        let restored = open.len();

        for mut record in open {
            if record.state == TransferState::Signed {
                warn!(
                    "{:?} was signed before restart; broadcast outcome unknown",
                    record.tx_hash
                );
                record.transition(TransferState::Broadcast)?;
                self.store.save_submission(&record).await?;
            }

            self.allocator
                .restore_in_flight(&record.key(), record.nonce, record.tx_hash)
                .await;
            self.tracker.register(record);
        }

        info!("Recovered {} open submissions", restored);
        Ok(restored)
    }

    /// Main loop
    pub async fn run(self: &Arc<Self>) -> RelayerResult<()> {
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let lease = Duration::from_secs(self.config.reservation_lease_secs);
        let mut lease_interval = interval((lease / 2).max(Duration::from_secs(1)));
        let mut prune_interval = interval(Duration::from_secs(300));

        info!("Payment relayer {} started", self.config.instance_id);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.process_intents().await {
                        error!("Error claiming payment intents: {}", e);
                    }
                    if let Err(e) = self.poll_submissions().await {
                        error!("Error polling submissions: {}", e);
                    }
                }

                _ = lease_interval.tick() => {
                    let expired = self.allocator.expire_leases(lease).await;
                    if !expired.is_empty() {
                        warn!("Released {} expired nonce reservations", expired.len());
                    }
                }

                _ = prune_interval.tick() => {
                    let pruned = self.tracker.prune(
                        chrono::Duration::seconds(RECORD_RETENTION_SECS),
                        Utc::now(),
                    );
                    debug!("Pruned {} settled submission records", pruned);
                }
            }
        }

        info!("Payment relayer stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Payment relayer shutdown initiated");
    }
}
