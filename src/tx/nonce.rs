//! Nonce allocation for shared custodial accounts
//!
//! Handles:
//! - Per (account, network) serialization of nonce reservations
//! - Gap-free reissue of nonces abandoned before broadcast
//! - Replacement attempts that race for an in-flight nonce
//! - Lease expiry for reservations whose build never finished

use crate::chain::NetworkReader;
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateStore;

use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The unit of nonce serialization: one account on one network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonceKey {
    pub account: Address,
    pub network: String,
}

impl NonceKey {
    pub fn new(account: Address, network: impl Into<String>) -> Self {
        Self {
            account,
            network: network.into(),
        }
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.network, self.account)
    }
}

/// Claim on a nonce value. Consumed by `release`; checked by `mark_broadcast`.
#[derive(Debug)]
pub struct NonceReservation {
    key: NonceKey,
    nonce: u64,
    lease: u64,
    replacement: bool,
}

impl NonceReservation {
    pub fn key(&self) -> &NonceKey {
        &self.key
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// True when this claims an already broadcast nonce for a replacement
    pub fn is_replacement(&self) -> bool {
        self.replacement
    }
}

#[derive(Debug)]
enum Slot {
    /// Claimed by a build that has not broadcast yet
    Reserved { lease: u64, since: Instant },
    /// Handed to the network at least once; never released again
    InFlight {
        attempts: Vec<H256>,
        replacement: Option<(u64, Instant)>,
    },
}

#[derive(Debug, Default)]
struct AccountNonces {
    /// Next never-issued value; `None` until the network has been read
    next: Option<u64>,
    slots: BTreeMap<u64, Slot>,
    /// Abandoned values below `next`, reissued lowest first so no gap survives
    released: BTreeSet<u64>,
    /// Every value below this was seen consumed on-chain
    consumed: u64,
}

impl AccountNonces {
    fn reconcile(&mut self, key: &NonceKey, network_count: u64) {
        match self.next {
            None => self.next = Some(network_count),
            Some(next) if network_count > next => {
                warn!(
                    "Network nonce {} ahead of local {} for {} - account used outside this relayer",
                    network_count, next, key
                );
                self.next = Some(network_count);
            }
            _ => {}
        }

        // Values the network has already counted can never be reissued
        let floor = network_count.max(self.consumed);
        self.released = self.released.split_off(&floor);

        // Unheld values below the tip were abandoned, e.g. across a restart
        if let Some(next) = self.next {
            for nonce in floor..next {
                if !self.slots.contains_key(&nonce) && self.released.insert(nonce) {
                    info!("Nonce {} for {} is unheld below the tip, queued for reissue", nonce, key);
                }
            }
        }

        for (nonce, slot) in self.slots.range(..network_count) {
            if matches!(slot, Slot::Reserved { .. }) {
                warn!(
                    "Reserved nonce {} for {} was consumed by another transaction; its broadcast will be rejected",
                    nonce, key
                );
            }
        }
    }

    /// Return an unbroadcast value to the pool without leaving a gap
    fn give_back(&mut self, nonce: u64) {
        self.slots.remove(&nonce);
        if self.next == Some(nonce + 1) {
            let mut next = nonce;
            while next > 0 && self.released.remove(&(next - 1)) {
                next -= 1;
            }
            self.next = Some(next);
        } else {
            self.released.insert(nonce);
        }
    }
}

/// Read-only view of one key's allocation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceSnapshot {
    pub next: Option<u64>,
    pub reserved: Vec<u64>,
    pub in_flight: Vec<u64>,
    pub released: Vec<u64>,
}

enum Claim {
    Fresh,
    Replacement,
}

/// Hands out collision-free, gap-free nonces per (account, network)
pub struct NonceAllocator {
    accounts: DashMap<NonceKey, Arc<Mutex<AccountNonces>>>,
    store: Arc<dyn StateStore>,
    lease_seq: AtomicU64,
}

impl NonceAllocator {
    /// Create a new nonce allocator recording reservations in `store`
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            accounts: DashMap::new(),
            store,
            lease_seq: AtomicU64::new(1),
        }
    }

    fn account(&self, key: &NonceKey) -> Arc<Mutex<AccountNonces>> {
        self.accounts
            .entry(key.clone())
            .or_insert_with(Default::default)
            .clone()
    }

    fn conflict(key: &NonceKey, nonce: u64, message: &str) -> RelayerError {
        RelayerError::NonceConflict {
            key: key.to_string(),
            nonce,
            message: message.to_string(),
        }
    }

    /// Claim the next nonce for a new transaction
    ///
    /// The key lock is held across the network read and the durable record of
    /// the reservation, and dropped before the caller signs or broadcasts.
    pub async fn reserve(
        &self,
        key: &NonceKey,
        reader: &dyn NetworkReader,
    ) -> RelayerResult<NonceReservation> {
        let account = self.account(key);
        let mut state = account.lock().await;

        let network_count = reader.get_nonce_count(key.account).await?;
        state.reconcile(key, network_count);

        let next = state.next.unwrap_or(network_count);
        let (nonce, reissued) = match state.released.first() {
            Some(&lowest) => (lowest, true),
            None => (next, false),
        };

        if state.slots.contains_key(&nonce) {
            error!("Nonce {} for {} is already held - refusing to allocate", nonce, key);
            crate::metrics::record_nonce_conflict(&key.network);
            return Err(Self::conflict(key, nonce, "candidate nonce is already held"));
        }

        if reissued {
            state.released.remove(&nonce);
        } else {
            state.next = Some(next + 1);
        }

        let lease = self.lease_seq.fetch_add(1, Ordering::SeqCst);
        state.slots.insert(
            nonce,
            Slot::Reserved {
                lease,
                since: Instant::now(),
            },
        );

        let reservation = NonceReservation {
            key: key.clone(),
            nonce,
            lease,
            replacement: false,
        };

        if let Err(e) = self.store.save_reservation(&reservation).await {
            state.give_back(nonce);
            return Err(e);
        }

        debug!(
            "Reserved nonce {} for {} (lease {}, reissued: {})",
            nonce, key, lease, reissued
        );
        crate::metrics::record_nonce_reserved(&key.network);

        Ok(reservation)
    }

    /// Claim an in-flight nonce so a replacement can be built for it
    pub async fn reserve_in_flight(
        &self,
        key: &NonceKey,
        nonce: u64,
    ) -> RelayerResult<NonceReservation> {
        let account = self.account(key);
        let mut state = account.lock().await;

        let lease = match state.slots.get_mut(&nonce) {
            Some(Slot::InFlight { replacement, .. }) => {
                if replacement.is_some() {
                    return Err(Self::conflict(
                        key,
                        nonce,
                        "a replacement is already being built",
                    ));
                }
                let lease = self.lease_seq.fetch_add(1, Ordering::SeqCst);
                *replacement = Some((lease, Instant::now()));
                lease
            }
            Some(Slot::Reserved { .. }) => {
                return Err(Self::conflict(key, nonce, "nonce has not been broadcast"));
            }
            None => {
                return Err(Self::conflict(key, nonce, "nonce is not in flight"));
            }
        };

        let reservation = NonceReservation {
            key: key.clone(),
            nonce,
            lease,
            replacement: true,
        };

        if let Err(e) = self.store.save_reservation(&reservation).await {
            if let Some(Slot::InFlight { replacement, .. }) = state.slots.get_mut(&nonce) {
                *replacement = None;
            }
            return Err(e);
        }

        info!("Reserved in-flight nonce {} for {} for replacement", nonce, key);
        Ok(reservation)
    }

    /// Give back a reservation whose build was abandoned before broadcast
    pub async fn release(&self, reservation: NonceReservation) -> RelayerResult<()> {
        let key = &reservation.key;
        let nonce = reservation.nonce;
        let account = self.account(key);
        let mut state = account.lock().await;

        let claim = match state.slots.get(&nonce) {
            Some(Slot::Reserved { lease, .. }) if *lease == reservation.lease => Claim::Fresh,
            Some(Slot::InFlight {
                replacement: Some((lease, _)),
                ..
            }) if *lease == reservation.lease => Claim::Replacement,
            Some(Slot::InFlight { .. }) => {
                return Err(Self::conflict(
                    key,
                    nonce,
                    "nonce was broadcast and can only be superseded by a replacement",
                ));
            }
            _ => return Err(Self::conflict(key, nonce, "reservation lease is no longer held")),
        };

        match claim {
            Claim::Fresh => state.give_back(nonce),
            Claim::Replacement => {
                if let Some(Slot::InFlight { replacement, .. }) = state.slots.get_mut(&nonce) {
                    *replacement = None;
                }
            }
        }

        self.store.clear_reservation(key, nonce).await?;

        debug!("Released nonce {} for {}", nonce, key);
        crate::metrics::record_nonce_released(&key.network);
        Ok(())
    }

    /// Record that the transaction holding `reservation` is about to be broadcast
    ///
    /// Fails if the lease expired in the meantime; the caller must not broadcast then.
    pub async fn mark_broadcast(
        &self,
        reservation: &NonceReservation,
        tx_hash: H256,
    ) -> RelayerResult<()> {
        let key = &reservation.key;
        let nonce = reservation.nonce;
        let account = self.account(key);
        let mut state = account.lock().await;

        let claim = match state.slots.get(&nonce) {
            Some(Slot::Reserved { lease, .. }) if *lease == reservation.lease => Claim::Fresh,
            Some(Slot::InFlight {
                replacement: Some((lease, _)),
                ..
            }) if *lease == reservation.lease => Claim::Replacement,
            _ => {
                return Err(Self::conflict(
                    key,
                    nonce,
                    "reservation lease expired before broadcast",
                ));
            }
        };

        match claim {
            Claim::Fresh => {
                state.slots.insert(
                    nonce,
                    Slot::InFlight {
                        attempts: vec![tx_hash],
                        replacement: None,
                    },
                );
            }
            Claim::Replacement => {
                if let Some(Slot::InFlight {
                    attempts,
                    replacement,
                }) = state.slots.get_mut(&nonce)
                {
                    attempts.push(tx_hash);
                    *replacement = None;
                }
            }
        }

        // The slot is in flight either way; recovery drops leftover reservation rows
        if let Err(e) = self.store.clear_reservation(key, nonce).await {
            warn!(
                "Failed to clear reservation of nonce {} for {} after broadcast: {}",
                nonce, key, e
            );
        }
        debug!("Nonce {} for {} in flight as {:?}", nonce, key, tx_hash);
        Ok(())
    }

    /// The network refused the payload outright, so the attempt never held the slot
    pub async fn rollback_broadcast(&self, key: &NonceKey, nonce: u64, tx_hash: H256) {
        let account = self.account(key);
        let mut state = account.lock().await;

        let now_empty = match state.slots.get_mut(&nonce) {
            Some(Slot::InFlight { attempts, .. }) => {
                attempts.retain(|h| *h != tx_hash);
                attempts.is_empty()
            }
            _ => false,
        };

        if now_empty {
            state.give_back(nonce);
            info!("Nonce {} for {} returned after rejected broadcast", nonce, key);
        }
    }

    /// The nonce was consumed on-chain (confirmed, reverted or replaced)
    pub async fn settle(&self, key: &NonceKey, nonce: u64) {
        let account = self.account(key);
        let mut state = account.lock().await;

        state.slots.remove(&nonce);
        state.consumed = state.consumed.max(nonce + 1);
        state.released = state.released.split_off(&(nonce + 1));
        if state.next.map_or(true, |next| next <= nonce) {
            state.next = Some(nonce + 1);
        }
        debug!("Settled nonce {} for {}", nonce, key);
    }

    /// Re-read the network count, e.g. after a "nonce too low" rejection
    pub async fn resync(&self, key: &NonceKey, reader: &dyn NetworkReader) -> RelayerResult<()> {
        let account = self.account(key);
        let mut state = account.lock().await;

        let network_count = reader.get_nonce_count(key.account).await?;
        state.reconcile(key, network_count);
        Ok(())
    }

    /// Reinstate an in-flight attempt after restart
    pub async fn restore_in_flight(&self, key: &NonceKey, nonce: u64, tx_hash: H256) {
        let account = self.account(key);
        let mut state = account.lock().await;

        match state.slots.entry(nonce).or_insert_with(|| Slot::InFlight {
            attempts: Vec::new(),
            replacement: None,
        }) {
            Slot::InFlight { attempts, .. } => {
                if !attempts.contains(&tx_hash) {
                    attempts.push(tx_hash);
                }
            }
            Slot::Reserved { .. } => {
                warn!("Restoring {:?} over a live reservation of nonce {} for {}", tx_hash, nonce, key);
            }
        }

        state.released.remove(&nonce);
        if state.next.map_or(true, |next| next <= nonce) {
            state.next = Some(nonce + 1);
        }
    }

    /// Release reservations (and replacement claims) older than `max_age`
    pub async fn expire_leases(&self, max_age: Duration) -> Vec<(NonceKey, u64)> {
        let accounts: Vec<(NonceKey, Arc<Mutex<AccountNonces>>)> = self
            .accounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired_all = Vec::new();
        for (key, account) in accounts {
            let mut state = account.lock().await;

            let expired: Vec<u64> = state
                .slots
                .iter()
                .filter_map(|(nonce, slot)| match slot {
                    Slot::Reserved { since, .. } if since.elapsed() >= max_age => Some(*nonce),
                    _ => None,
                })
                .collect();

            for nonce in expired {
                warn!("Reservation of nonce {} for {} expired before broadcast", nonce, key);
                state.give_back(nonce);
                if let Err(e) = self.store.clear_reservation(&key, nonce).await {
                    error!("Failed to clear expired reservation {} for {}: {}", nonce, key, e);
                }
                crate::metrics::record_nonce_released(&key.network);
                expired_all.push((key.clone(), nonce));
            }

            for (nonce, slot) in state.slots.iter_mut() {
                if let Slot::InFlight { replacement, .. } = slot {
                    if matches!(replacement, Some((_, since)) if since.elapsed() >= max_age) {
                        warn!("Replacement claim on nonce {} for {} expired", nonce, key);
                        *replacement = None;
                    }
                }
            }
        }

        expired_all
    }

    /// Snapshot of one key's state
    pub async fn snapshot(&self, key: &NonceKey) -> Option<NonceSnapshot> {
        let account = self.accounts.get(key).map(|a| a.value().clone())?;
        let state = account.lock().await;

        let mut reserved = Vec::new();
        let mut in_flight = Vec::new();
        for (nonce, slot) in &state.slots {
            match slot {
                Slot::Reserved { .. } => reserved.push(*nonce),
                Slot::InFlight { .. } => in_flight.push(*nonce),
            }
        }

        Some(NonceSnapshot {
            next: state.next,
            reserved,
            in_flight,
            released: state.released.iter().copied().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkReader;
    use crate::state::{MemoryStore, MockStateStore};
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn key() -> NonceKey {
        NonceKey::new(Address::repeat_byte(0x0a), "base")
    }

    fn reader_at(count: u64) -> MockNetworkReader {
        let mut reader = MockNetworkReader::new();
        reader.expect_get_nonce_count().returning(move |_| Ok(count));
        reader
    }

    fn allocator() -> NonceAllocator {
        NonceAllocator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_first_reservation_starts_at_pending_count() {
        let allocator = allocator();
        let reader = reader_at(5);

        let first = allocator.reserve(&key(), &reader).await.unwrap();
        let second = allocator.reserve(&key(), &reader).await.unwrap();

        assert_eq!(first.nonce(), 5);
        assert_eq!(second.nonce(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_contiguous_and_unique() {
        let allocator = Arc::new(allocator());
        let reader = Arc::new(reader_at(5));

        let tasks = (0..32).map(|_| {
            let allocator = allocator.clone();
            let reader = reader.clone();
            tokio::spawn(async move { allocator.reserve(&key(), reader.as_ref()).await })
        });

        let mut nonces: Vec<u64> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().nonce())
            .collect();
        nonces.sort_unstable();

        assert_eq!(nonces, (5..37).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let allocator = allocator();
        let reader = reader_at(3);
        let other = NonceKey::new(Address::repeat_byte(0x0b), "base");
        let other_network = NonceKey::new(Address::repeat_byte(0x0a), "ethereum");

        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 3);
        assert_eq!(allocator.reserve(&other, &reader).await.unwrap().nonce(), 3);
        assert_eq!(allocator.reserve(&other_network, &reader).await.unwrap().nonce(), 3);
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 4);
    }

    #[tokio::test]
    async fn test_release_of_tip_rewinds() {
        let allocator = allocator();
        let reader = reader_at(5);

        let first = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(allocator.release(first).await);

        let again = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!(again.nonce(), 5);
    }

    #[tokio::test]
    async fn test_released_middle_value_is_reissued_first() {
        let allocator = allocator();
        let reader = reader_at(5);

        let a = allocator.reserve(&key(), &reader).await.unwrap();
        let b = allocator.reserve(&key(), &reader).await.unwrap();
        let c = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!((a.nonce(), b.nonce(), c.nonce()), (5, 6, 7));

        assert_ok!(allocator.release(b).await);
        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.released, vec![6]);

        let refill = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!(refill.nonce(), 6);
        let fresh = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!(fresh.nonce(), 8);
    }

    #[tokio::test]
    async fn test_rewind_collapses_released_values_below_tip() {
        let allocator = allocator();
        let reader = reader_at(5);

        let a = allocator.reserve(&key(), &reader).await.unwrap();
        let b = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(allocator.release(a).await);
        assert_ok!(allocator.release(b).await);

        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.next, Some(5));
        assert!(snapshot.released.is_empty());
    }

    #[tokio::test]
    async fn test_release_after_broadcast_fails() {
        let allocator = allocator();
        let reader = reader_at(5);

        let reservation = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&reservation, H256::repeat_byte(1))
                .await
        );

        let err = allocator.release(reservation).await.unwrap_err();
        assert!(matches!(err, RelayerError::NonceConflict { nonce: 5, .. }));

        // the broadcast value stays out of circulation
        let next = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!(next.nonce(), 6);
    }

    #[tokio::test]
    async fn test_network_ahead_jumps_forward_and_drops_consumed_releases() {
        let allocator = allocator();

        let a = allocator.reserve(&key(), &reader_at(5)).await.unwrap();
        let _b = allocator.reserve(&key(), &reader_at(5)).await.unwrap();
        assert_ok!(allocator.release(a).await);

        // someone else sent 5..=9 from the same wallet
        let next = allocator.reserve(&key(), &reader_at(10)).await.unwrap();
        assert_eq!(next.nonce(), 10);
        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert!(snapshot.released.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_broadcast() {
        let allocator = allocator();
        let reader = reader_at(5);

        let stale = allocator.reserve(&key(), &reader).await.unwrap();
        let expired = allocator.expire_leases(Duration::ZERO).await;
        assert_eq!(expired, vec![(key(), 5)]);

        // reissued to a new build under a new lease
        let fresh = allocator.reserve(&key(), &reader).await.unwrap();
        assert_eq!(fresh.nonce(), 5);
        assert_ne!(fresh.lease(), stale.lease());

        assert_err!(
            allocator
                .mark_broadcast(&stale, H256::repeat_byte(1))
                .await
        );
        assert_ok!(
            allocator
                .mark_broadcast(&fresh, H256::repeat_byte(2))
                .await
        );
    }

    #[tokio::test]
    async fn test_replacement_claims_in_flight_slot() {
        let allocator = allocator();
        let reader = reader_at(5);

        let original = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&original, H256::repeat_byte(1))
                .await
        );

        let replacement = allocator.reserve_in_flight(&key(), 5).await.unwrap();
        assert!(replacement.is_replacement());
        // only one replacement may be built at a time
        assert_err!(allocator.reserve_in_flight(&key(), 5).await);

        // abandoning the replacement keeps the slot in flight
        assert_ok!(allocator.release(replacement).await);
        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.in_flight, vec![5]);

        let replacement = allocator.reserve_in_flight(&key(), 5).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&replacement, H256::repeat_byte(2))
                .await
        );

        // a fresh reservation never lands on the in-flight value
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 6);
    }

    #[tokio::test]
    async fn test_replacement_requires_broadcast_nonce() {
        let allocator = allocator();
        let reader = reader_at(5);

        let _held = allocator.reserve(&key(), &reader).await.unwrap();
        assert_err!(allocator.reserve_in_flight(&key(), 5).await);
        assert_err!(allocator.reserve_in_flight(&key(), 9).await);
    }

    #[tokio::test]
    async fn test_rollback_returns_value_when_no_attempt_remains() {
        let allocator = allocator();
        let reader = reader_at(5);

        let reservation = allocator.reserve(&key(), &reader).await.unwrap();
        let hash = H256::repeat_byte(1);
        assert_ok!(allocator.mark_broadcast(&reservation, hash).await);

        allocator.rollback_broadcast(&key(), 5, hash).await;

        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 5);
    }

    #[tokio::test]
    async fn test_settle_forgets_slot() {
        let allocator = allocator();
        let reader = reader_at(5);

        let reservation = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&reservation, H256::repeat_byte(1))
                .await
        );
        allocator.settle(&key(), 5).await;

        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert!(snapshot.in_flight.is_empty());
        assert_eq!(snapshot.next, Some(6));
    }

    #[tokio::test]
    async fn test_restore_in_flight_blocks_reissue() {
        let allocator = allocator();
        allocator
            .restore_in_flight(&key(), 5, H256::repeat_byte(1))
            .await;

        // the node has not seen it yet but the relayer must not reuse it
        let next = allocator.reserve(&key(), &reader_at(5)).await.unwrap();
        assert_eq!(next.nonce(), 6);
    }

    #[tokio::test]
    async fn test_unheld_value_below_tip_is_reissued() {
        let allocator = allocator();
        // 5 was reserved but never broadcast before a restart, 6 went out
        allocator
            .restore_in_flight(&key(), 6, H256::repeat_byte(1))
            .await;

        let reader = reader_at(5);
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 5);
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 7);
    }

    #[tokio::test]
    async fn test_settled_value_survives_lagging_count() {
        let allocator = allocator();
        let reader = reader_at(5);

        let reservation = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&reservation, H256::repeat_byte(1))
                .await
        );
        allocator.settle(&key(), 5).await;

        // the node still reports the pre-inclusion count
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 6);
    }

    #[tokio::test]
    async fn test_failed_reservation_record_returns_value() {
        let mut store = MockStateStore::new();
        store
            .expect_save_reservation()
            .times(1)
            .returning(|_| Err(RelayerError::Internal("db down".to_string())));
        let allocator = NonceAllocator::new(Arc::new(store));

        assert_err!(allocator.reserve(&key(), &reader_at(5)).await);

        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.next, Some(5));
        assert!(snapshot.reserved.is_empty());
        assert!(snapshot.released.is_empty());
    }

    #[tokio::test]
    async fn test_clear_failure_after_broadcast_keeps_slot_consistent() {
        let mut store = MockStateStore::new();
        store.expect_save_reservation().returning(|_| Ok(()));
        store
            .expect_clear_reservation()
            .returning(|_, _| Err(RelayerError::Internal("db down".to_string())));
        let allocator = NonceAllocator::new(Arc::new(store));
        let reader = reader_at(5);

        let reservation = allocator.reserve(&key(), &reader).await.unwrap();
        assert_ok!(
            allocator
                .mark_broadcast(&reservation, H256::repeat_byte(1))
                .await
        );

        let snapshot = allocator.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.in_flight, vec![5]);
        assert!(snapshot.reserved.is_empty());

        // a refused payload still hands the value back
        allocator.rollback_broadcast(&key(), 5, H256::repeat_byte(1)).await;
        assert_eq!(allocator.reserve(&key(), &reader).await.unwrap().nonce(), 5);
    }
}
