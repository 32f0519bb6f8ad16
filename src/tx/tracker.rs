//! Submission tracking
//!
//! Every broadcast attempt is a `SubmissionRecord`. Attempts sharing a nonce
//! race for the same slot; at most one of them can be included, and the
//! tracker resolves the others as replaced once the slot is consumed.

use super::gas::FeeParams;
use super::nonce::NonceKey;
use super::signer::SignedTransaction;
use crate::chain::{Broadcaster, NetworkReader, TxReceipt};
use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of one transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Built,
    Signed,
    Broadcast,
    /// No receipt within the watch window; still open
    Stuck,
    Confirmed,
    /// Included but reverted, or refused by the network
    Failed,
    /// Another transaction consumed the nonce
    Replaced,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Built => "built",
            TransferState::Signed => "signed",
            TransferState::Broadcast => "broadcast",
            TransferState::Stuck => "stuck",
            TransferState::Confirmed => "confirmed",
            TransferState::Failed => "failed",
            TransferState::Replaced => "replaced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "built" => Some(TransferState::Built),
            "signed" => Some(TransferState::Signed),
            "broadcast" => Some(TransferState::Broadcast),
            "stuck" => Some(TransferState::Stuck),
            "confirmed" => Some(TransferState::Confirmed),
            "failed" => Some(TransferState::Failed),
            "replaced" => Some(TransferState::Replaced),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Confirmed | TransferState::Failed | TransferState::Replaced
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Built, Signed)
                | (Built, Failed)
                | (Signed, Broadcast)
                | (Signed, Failed)
                | (Broadcast, Stuck)
                | (Broadcast, Confirmed)
                | (Broadcast, Failed)
                | (Broadcast, Replaced)
                | (Stuck, Confirmed)
                | (Stuck, Failed)
                | (Stuck, Replaced)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of one signed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub tx_hash: H256,
    pub payment_id: Uuid,
    pub network: String,
    pub account: Address,
    pub nonce: u64,
    pub state: TransferState,
    pub fee: FeeParams,
    pub gas_limit: u64,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// gas used x effective gas price, once included
    pub effective_fee: Option<U256>,
    pub block_number: Option<u64>,
    /// Sibling attempt that consumed the nonce; `None` for a foreign transaction
    pub replaced_by: Option<H256>,
    pub failure_reason: Option<String>,
}

impl SubmissionRecord {
    /// Record for a freshly signed attempt, written before broadcast
    pub fn new(signed: &SignedTransaction, payment_id: Uuid, network: impl Into<String>) -> Self {
        let now = Utc::now();
        let unsigned = signed.unsigned();
        Self {
            tx_hash: signed.hash(),
            payment_id,
            network: network.into(),
            account: unsigned.from,
            nonce: unsigned.nonce,
            state: TransferState::Signed,
            fee: unsigned.fee,
            gas_limit: unsigned.gas_limit,
            submitted_at: now,
            updated_at: now,
            effective_fee: None,
            block_number: None,
            replaced_by: None,
            failure_reason: None,
        }
    }

    pub fn key(&self) -> NonceKey {
        NonceKey::new(self.account, self.network.clone())
    }

    pub fn transition(&mut self, next: TransferState) -> RelayerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Network response to a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(H256),
    /// Transport failure: the payload may or may not have reached the network
    Ambiguous(String),
    /// Refused outright; the nonce was not consumed
    Rejected(String),
    /// The nonce is already used on-chain
    NonceConsumed,
}

/// A state change produced by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub tx_hash: H256,
    pub payment_id: Uuid,
    pub key: NonceKey,
    pub nonce: u64,
    pub from: TransferState,
    pub to: TransferState,
    pub replaced_by: Option<H256>,
}

/// Result of polling one nonce slot
#[derive(Debug, Default)]
pub struct SlotPoll {
    pub changes: Vec<StatusChange>,
    /// The nonce has been consumed on-chain and the slot is closed
    pub consumed: bool,
}

/// Tracks open submissions grouped by nonce slot
pub struct SubmissionTracker {
    records: DashMap<H256, SubmissionRecord>,
    slots: DashMap<(NonceKey, u64), Vec<H256>>,
    watch_window: Duration,
}

impl SubmissionTracker {
    pub fn new(watch_window: std::time::Duration) -> Self {
        Self {
            records: DashMap::new(),
            slots: DashMap::new(),
            watch_window: Duration::seconds(watch_window.as_secs() as i64),
        }
    }

    /// Hand a signed payload to the network and classify the response
    pub async fn submit(
        &self,
        signed: &SignedTransaction,
        broadcaster: &dyn Broadcaster,
    ) -> SubmitOutcome {
        match broadcaster.submit(signed.raw().clone()).await {
            Ok(hash) => {
                if hash != signed.hash() {
                    warn!(
                        "Network reported hash {:?} for locally computed {:?}",
                        hash,
                        signed.hash()
                    );
                }
                SubmitOutcome::Accepted(signed.hash())
            }
            Err(RelayerError::NonceTooLow { .. }) => SubmitOutcome::NonceConsumed,
            Err(RelayerError::SubmissionRejected { reason, .. }) => SubmitOutcome::Rejected(reason),
            Err(e) => SubmitOutcome::Ambiguous(e.to_string()),
        }
    }

    /// Start tracking an attempt under its nonce slot
    pub fn register(&self, record: SubmissionRecord) {
        let slot = (record.key(), record.nonce);
        let hash = record.tx_hash;

        let mut attempts = self.slots.entry(slot).or_insert_with(Vec::new);
        if !attempts.contains(&hash) {
            attempts.push(hash);
        }
        drop(attempts);

        debug!("Tracking {:?} (nonce {}, state {})", hash, record.nonce, record.state);
        self.records.insert(hash, record);
    }

    /// Apply a transition to a tracked record
    pub fn mark(&self, tx_hash: H256, next: TransferState) -> RelayerResult<StatusChange> {
        self.update(tx_hash, next, |_| {})
    }

    /// Mark a submitted attempt broadcast
    ///
    /// An attempt whose slot resolved while it was being signed or submitted
    /// can no longer land, so it is marked replaced right away.
    pub fn broadcast(&self, tx_hash: H256) -> RelayerResult<Vec<StatusChange>> {
        let change = self.mark(tx_hash, TransferState::Broadcast)?;

        let slot = (change.key.clone(), change.nonce);
        let open = self
            .slots
            .get(&slot)
            .map(|attempts| attempts.contains(&tx_hash))
            .unwrap_or(false);
        if open {
            return Ok(vec![change]);
        }

        let winner = self
            .records
            .iter()
            .find(|entry| {
                let r = entry.value();
                r.account == change.key.account
                    && r.network == change.key.network
                    && r.nonce == change.nonce
                    && matches!(r.state, TransferState::Confirmed | TransferState::Failed)
            })
            .map(|entry| *entry.key());

        warn!(
            "{:?} reached the network after nonce {} for {} was resolved",
            tx_hash, change.nonce, change.key
        );
        let replaced = self.update(tx_hash, TransferState::Replaced, |record| {
            record.replaced_by = winner;
        })?;
        Ok(vec![change, replaced])
    }

    /// Mark a refused attempt failed and drop it from its slot
    pub fn reject(&self, tx_hash: H256, reason: &str) -> RelayerResult<StatusChange> {
        let change = self.update(tx_hash, TransferState::Failed, |record| {
            record.failure_reason = Some(reason.to_string());
        })?;
        self.detach(&change.key, change.nonce, tx_hash);
        Ok(change)
    }

    fn update(
        &self,
        tx_hash: H256,
        next: TransferState,
        apply: impl FnOnce(&mut SubmissionRecord),
    ) -> RelayerResult<StatusChange> {
        let mut record = self
            .records
            .get_mut(&tx_hash)
            .ok_or_else(|| RelayerError::SubmissionNotFound {
                tx_hash: format!("{:?}", tx_hash),
            })?;

        let from = record.state;
        record.transition(next)?;
        apply(record.value_mut());

        Ok(StatusChange {
            tx_hash,
            payment_id: record.payment_id,
            key: record.value().key(),
            nonce: record.nonce,
            from,
            to: next,
            replaced_by: record.replaced_by,
        })
    }

    fn detach(&self, key: &NonceKey, nonce: u64, tx_hash: H256) {
        let slot = (key.clone(), nonce);
        let now_empty = match self.slots.get_mut(&slot) {
            Some(mut attempts) => {
                attempts.retain(|h| *h != tx_hash);
                attempts.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.slots.remove(&slot);
        }
    }

    /// Resolve one nonce slot against the network
    pub async fn poll_slot(
        &self,
        key: &NonceKey,
        nonce: u64,
        reader: &dyn NetworkReader,
        now: DateTime<Utc>,
    ) -> RelayerResult<SlotPoll> {
        let attempts = self.open_attempts(key, nonce);
        if attempts.is_empty() {
            return Ok(SlotPoll::default());
        }

        // Read before the receipts: a count past the nonce then means any
        // receipt of ours is already visible.
        let confirmed_count = reader.get_confirmed_nonce_count(key.account).await?;

        let mut included: Option<(H256, TxReceipt)> = None;
        for hash in &attempts {
            if let Some(receipt) = reader.get_receipt(*hash).await? {
                included = Some((*hash, receipt));
                break;
            }
        }

        let mut poll = SlotPoll::default();
        match included {
            Some((winner, receipt)) => {
                let outcome = if receipt.success {
                    TransferState::Confirmed
                } else {
                    TransferState::Failed
                };

                poll.changes.push(self.update(winner, outcome, |record| {
                    record.effective_fee = receipt.effective_fee();
                    record.block_number = Some(receipt.block_number);
                    if !receipt.success {
                        record.failure_reason = Some("transaction reverted".to_string());
                    }
                })?);

                for sibling in attempts.iter().filter(|h| **h != winner) {
                    poll.changes.push(self.update(*sibling, TransferState::Replaced, |record| {
                        record.replaced_by = Some(winner);
                    })?);
                }

                info!(
                    "Nonce {} for {} resolved by {:?} in block {} ({})",
                    nonce, key, winner, receipt.block_number, outcome
                );
                self.slots.remove(&(key.clone(), nonce));
                poll.consumed = true;
            }
            None if confirmed_count > nonce => {
                warn!(
                    "Nonce {} for {} consumed by a transaction this relayer did not send",
                    nonce, key
                );
                for hash in &attempts {
                    poll.changes
                        .push(self.update(*hash, TransferState::Replaced, |_| {})?);
                }
                self.slots.remove(&(key.clone(), nonce));
                poll.consumed = true;
            }
            None => {
                for hash in &attempts {
                    let overdue = self
                        .records
                        .get(hash)
                        .map(|r| {
                            r.state == TransferState::Broadcast
                                && now - r.submitted_at >= self.watch_window
                        })
                        .unwrap_or(false);
                    if overdue {
                        warn!("{:?} has no receipt after the watch window", hash);
                        poll.changes.push(self.mark(*hash, TransferState::Stuck)?);
                    }
                }
            }
        }

        Ok(poll)
    }

    /// Non-terminal, broadcast attempts for a slot
    fn open_attempts(&self, key: &NonceKey, nonce: u64) -> Vec<H256> {
        let Some(attempts) = self.slots.get(&(key.clone(), nonce)) else {
            return Vec::new();
        };
        attempts
            .iter()
            .filter(|hash| {
                self.records
                    .get(*hash)
                    .map(|r| matches!(r.state, TransferState::Broadcast | TransferState::Stuck))
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn get(&self, tx_hash: &H256) -> Option<SubmissionRecord> {
        self.records.get(tx_hash).map(|r| r.value().clone())
    }

    /// Slots with at least one attempt still in flight
    pub fn open_slots(&self) -> Vec<(NonceKey, u64)> {
        let mut slots: Vec<(NonceKey, u64)> = self.slots.iter().map(|e| e.key().clone()).collect();
        slots.sort_by(|a, b| (&a.0.network, a.0.account, a.1).cmp(&(&b.0.network, b.0.account, b.1)));
        slots
    }

    /// Forget terminal records older than `max_age`
    pub fn prune(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.state.is_terminal() && now - r.updated_at >= max_age));
        before - self.records.len()
    }
}
