//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Network connection status
//! - Nonce reservations and releases
//! - Submissions by outcome
//! - Fees paid and build latency

use crate::error::{RelayerError, RelayerResult};
use crate::tx::TransferState;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref NETWORK_CONNECTED: GaugeVec = register_gauge_vec!(
        "relayer_network_connected",
        "Network connection status (1=connected, 0=disconnected)",
        &["network"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCES_RESERVED: CounterVec = register_counter_vec!(
        "relayer_nonces_reserved_total",
        "Total nonces reserved",
        &["network"]
    ).unwrap();

    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "relayer_nonces_released_total",
        "Total nonce reservations released before broadcast",
        &["network"]
    ).unwrap();

    pub static ref NONCE_CONFLICTS: CounterVec = register_counter_vec!(
        "relayer_nonce_conflicts_total",
        "Total nonce allocation conflicts",
        &["network"]
    ).unwrap();

    // Submission metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Broadcast attempts by outcome",
        &["network", "outcome"]
    ).unwrap();

    pub static ref TRANSFER_STATES: CounterVec = register_counter_vec!(
        "relayer_transfer_transitions_total",
        "Transfer state transitions by target state",
        &["network", "state"]
    ).unwrap();

    pub static ref BUILD_FAILURES: CounterVec = register_counter_vec!(
        "relayer_build_failures_total",
        "Transfers that failed before broadcast, by error kind",
        &["network", "kind"]
    ).unwrap();

    pub static ref FEE_PAID_GWEI: HistogramVec = register_histogram_vec!(
        "relayer_fee_paid_gwei",
        "Effective fee paid per confirmed transfer, in gwei",
        &["network"],
        vec![1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0, 100_000_000.0]
    ).unwrap();

    pub static ref BUILD_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_build_latency_seconds",
        "Time from intent to broadcast",
        &["network"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_network_health(network: &str, healthy: bool) {
    NETWORK_CONNECTED
        .with_label_values(&[network])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_nonce_reserved(network: &str) {
    NONCES_RESERVED.with_label_values(&[network]).inc();
}

pub fn record_nonce_released(network: &str) {
    NONCES_RELEASED.with_label_values(&[network]).inc();
}

pub fn record_nonce_conflict(network: &str) {
    NONCE_CONFLICTS.with_label_values(&[network]).inc();
}

pub fn record_submission(network: &str, outcome: &str) {
    SUBMISSIONS.with_label_values(&[network, outcome]).inc();
}

pub fn record_transition(network: &str, state: TransferState) {
    TRANSFER_STATES
        .with_label_values(&[network, state.as_str()])
        .inc();
}

pub fn record_build_failure(network: &str, kind: &str) {
    BUILD_FAILURES.with_label_values(&[network, kind]).inc();
}

pub fn record_fee_paid(network: &str, fee_wei: ethers::types::U256) {
    let gwei = (fee_wei / ethers::types::U256::exp10(9)).low_u128() as f64;
    FEE_PAID_GWEI.with_label_values(&[network]).observe(gwei);
}

pub fn record_build_latency(network: &str, latency_secs: f64) {
    BUILD_LATENCY
        .with_label_values(&[network])
        .observe(latency_secs);
}
