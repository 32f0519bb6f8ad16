//! End-to-end transfer scenarios against an in-process fake network

mod common;

use common::{Harness, GWEI};
use ethers::types::U256;
use transfer_relayer::error::RelayerError;
use transfer_relayer::payment::{Currency, PaymentStatus};
use transfer_relayer::tx::{FeeParams, NonceKey, TransferState};

#[tokio::test]
async fn test_concurrent_intents_get_consecutive_nonces() {
    let harness = Harness::new(5);
    let first = harness.intent(Currency::Usdc);
    let second = harness.intent(Currency::Usdc);
    harness.store.enqueue_intent(first.clone()).await;
    harness.store.enqueue_intent(second.clone()).await;

    let claimed = harness.relayer.process_intents().await.unwrap();
    assert_eq!(claimed, 2);
    assert_eq!(harness.network.broadcast_count(), 2);

    let mut nonces = Vec::new();
    for intent in [&first, &second] {
        let payment = harness.store.payment(intent.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Submitted);

        let record = harness
            .relayer
            .submission(payment.tx_hash.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TransferState::Broadcast);
        nonces.push(record.nonce);
    }
    nonces.sort();
    assert_eq!(nonces, vec![5, 6]);

    let snapshot = harness
        .relayer
        .nonce_snapshot(&NonceKey::new(harness.wallet, common::NETWORK))
        .await
        .unwrap();
    assert_eq!(snapshot.in_flight, vec![5, 6]);
    assert!(snapshot.reserved.is_empty());
}

#[tokio::test]
async fn test_unsupported_currency_touches_nothing() {
    let harness = Harness::new(5);
    let intent = harness.intent(Currency::Other("DOGE".to_string()));
    harness.store.enqueue_intent(intent.clone()).await;

    harness.relayer.process_intents().await.unwrap();

    let payment = harness.store.payment(intent.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment.tx_hash.is_none());
    assert!(payment.failure_reason.unwrap().contains("DOGE"));

    assert_eq!(harness.network.read_count(), 0);
    assert_eq!(harness.network.broadcast_count(), 0);
    assert!(harness
        .relayer
        .nonce_snapshot(&NonceKey::new(harness.wallet, common::NETWORK))
        .await
        .is_none());
}

#[tokio::test]
async fn test_simulation_failure_signs_nothing() {
    let harness = Harness::new(5);
    *harness.network.revert.lock().unwrap() =
        Some("ERC20: transfer amount exceeds balance".to_string());
    let intent = harness.intent(Currency::Usdc);

    let err = harness.relayer.build_and_submit(&intent).await.unwrap_err();
    assert!(matches!(err, RelayerError::GasSimulationFailed(_)));
    assert_eq!(harness.network.broadcast_count(), 0);

    // The nonce was never reserved, so the next transfer still gets 5
    *harness.network.revert.lock().unwrap() = None;
    let tx_hash = harness.relayer.build_and_submit(&intent).await.unwrap();
    let record = harness.relayer.submission(tx_hash).await.unwrap().unwrap();
    assert_eq!(record.nonce, 5);
}

#[tokio::test]
async fn test_replaced_attempt_is_never_confirmed() {
    let harness = Harness::new(5);
    let intent = harness.intent(Currency::Usdc);
    harness.store.enqueue_intent(intent.clone()).await;

    let original = harness.relayer.build_and_submit(&intent).await.unwrap();
    let replacement = harness.relayer.replace(original, &intent).await.unwrap();
    assert_ne!(original, replacement);
    assert_eq!(harness.network.broadcast_count(), 2);

    let bumped = harness.relayer.submission(replacement).await.unwrap().unwrap();
    assert_eq!(bumped.nonce, 5);
    assert_eq!(
        bumped.fee,
        FeeParams::Legacy {
            gas_price: U256::from(33 * GWEI)
        }
    );

    harness.network.mine(replacement, 5, true);
    harness.relayer.poll_submissions().await.unwrap();

    let winner = harness.relayer.submission(replacement).await.unwrap().unwrap();
    assert_eq!(winner.state, TransferState::Confirmed);
    assert_eq!(winner.effective_fee, Some(U256::from(45_000u64) * U256::from(30 * GWEI)));

    let loser = harness.relayer.submission(original).await.unwrap().unwrap();
    assert_eq!(loser.state, TransferState::Replaced);
    assert_eq!(loser.replaced_by, Some(replacement));

    // Later polls leave the replaced attempt alone
    harness.relayer.poll_submissions().await.unwrap();
    let loser = harness.relayer.submission(original).await.unwrap().unwrap();
    assert_eq!(loser.state, TransferState::Replaced);

    let payment = harness.store.payment(intent.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert_eq!(payment.tx_hash, Some(replacement));
}

#[tokio::test]
async fn test_foreign_transaction_fails_the_payment() {
    let harness = Harness::new(5);
    let intent = harness.intent(Currency::Usdc);
    harness.store.enqueue_intent(intent.clone()).await;

    let tx_hash = harness.relayer.build_and_submit(&intent).await.unwrap();

    // Nonce 5 consumed without any receipt for our attempt
    *harness.network.confirmed_count.lock().unwrap() = 6;
    harness.relayer.poll_submissions().await.unwrap();

    let record = harness.relayer.submission(tx_hash).await.unwrap().unwrap();
    assert_eq!(record.state, TransferState::Replaced);
    assert!(record.replaced_by.is_none());

    let payment = harness.store.payment(intent.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
}
