//! HTTP API for health checks and transfer status

use crate::config::ApiConfig;
use crate::coordination::PaymentRelayer;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{NonceKey, NonceSnapshot, SubmissionRecord};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relayer: Arc<PaymentRelayer>,
}

pub fn router(relayer: Arc<PaymentRelayer>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/submissions/:hash", get(get_submission))
        .route("/nonces/:network/:address", get(get_nonces))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { relayer })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, relayer: Arc<PaymentRelayer>) -> RelayerResult<()> {
    let app = router(relayer);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.relayer.store().health_check().await.is_ok();

    let network_health = state.relayer.chains().health_check().await;
    let networks_ok = network_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && networks_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            networks: network_health
                .into_iter()
                .map(|(network, healthy)| NetworkHealth { network, healthy })
                .collect(),
        }),
    )
}

/// Look up one submission attempt by transaction hash
async fn get_submission(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<SubmissionRecord>, (StatusCode, Json<ErrorResponse>)> {
    let tx_hash: H256 = hash
        .parse()
        .map_err(|_| bad_request(format!("invalid transaction hash: {}", hash)))?;

    match state.relayer.submission(tx_hash).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(not_found(format!("no submission {}", hash))),
        Err(e) => {
            error!("Submission lookup failed for {}: {}", hash, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "lookup failed".to_string(),
                }),
            ))
        }
    }
}

/// Nonce allocation state of one account on one network
async fn get_nonces(
    State(state): State<AppState>,
    Path((network, address)): Path<(String, String)>,
) -> Result<Json<NonceSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    let account: Address = address
        .parse()
        .map_err(|_| bad_request(format!("invalid address: {}", address)))?;

    state
        .relayer
        .nonce_snapshot(&NonceKey::new(account, network.clone()))
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("no nonce state for {} on {}", address, network)))
}

fn bad_request(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error }))
}

fn not_found(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error }))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    networks: Vec<NetworkHealth>,
}

#[derive(Serialize)]
struct NetworkHealth {
    network: String,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainManager;
    use crate::config::RelayerConfig;
    use crate::state::MemoryStore;
    use crate::tx::MockSigningGateway;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = RelayerConfig {
            instance_id: "test".to_string(),
            poll_interval_ms: 100,
            max_concurrent_transfers: 10,
            watch_window_secs: 300,
            signing_timeout_ms: 1000,
            reservation_lease_secs: 60,
            replacement_bump_percent: 10,
            health_check_interval_secs: 30,
        };
        let relayer = PaymentRelayer::new(
            Arc::new(ChainManager::from_contexts(Vec::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(MockSigningGateway::new()),
            config,
            "",
        );
        router(Arc::new(relayer))
    }

    async fn status_of(uri: &str) -> StatusCode {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        assert_eq!(status_of("/health").await, StatusCode::OK);
        assert_eq!(status_of("/ready").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submission_lookup() {
        assert_eq!(
            status_of("/submissions/not-a-hash").await,
            StatusCode::BAD_REQUEST
        );
        let unknown = format!("/submissions/{:?}", H256::repeat_byte(1));
        assert_eq!(status_of(&unknown).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_nonce_lookup() {
        assert_eq!(status_of("/nonces/base/0x1234").await, StatusCode::BAD_REQUEST);
        let unknown = format!("/nonces/base/{:?}", Address::repeat_byte(0x0a));
        assert_eq!(status_of(&unknown).await, StatusCode::NOT_FOUND);
    }
}
