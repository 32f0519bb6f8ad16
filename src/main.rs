//! Transfer Relayer - turns payment intents into signed on-chain transfers
//!
//! The relayer claims initiated payment intents, builds and signs one token
//! transfer per intent, and tracks each submission until the network settles it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use transfer_relayer::api;
use transfer_relayer::chain::ChainManager;
use transfer_relayer::config::{Settings, SignerConfig};
use transfer_relayer::coordination::PaymentRelayer;
use transfer_relayer::metrics::MetricsServer;
use transfer_relayer::state::{MemoryStore, StateManager, StateStore};
use transfer_relayer::tx::{CustodyApiSigner, LocalWalletSigner, SigningGateway};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Transfer Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} networks",
        settings.enabled_networks().len()
    );

    // Initialize state store
    let store: Arc<dyn StateStore> = match &settings.database {
        Some(database) => {
            let state_manager = StateManager::new(database).await?;
            info!("Database connection established");

            state_manager.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(state_manager)
        }
        None => {
            warn!("No database configured - using the in-memory store, state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize signing gateway
    let (signer, authentication_proof) = build_signer(&settings.signer)?;

    // Initialize chain manager (handles all network connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Network connections initialized");

    // Initialize payment relayer and pick up submissions left by a previous run
    let relayer = Arc::new(PaymentRelayer::new(
        chain_manager.clone(),
        store.clone(),
        signer,
        settings.relayer.clone(),
        authentication_proof,
    ));
    let recovered = relayer.recover().await?;
    info!("Payment relayer initialized ({} submissions recovered)", recovered);

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let relayer = relayer.clone();
        async move {
            if let Err(e) = api::run_server(config, relayer).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start payment relayer
    let relayer_handle = tokio::spawn({
        let relayer = relayer.clone();
        async move {
            if let Err(e) = relayer.run().await {
                error!("Payment relayer error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                // Network health is logged and exported by the manager
                chain_manager.health_check().await;

                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                }
            }
        }
    });

    info!("Transfer Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    relayer.stop().await;

    // Abort background tasks
    api_handle.abort();
    relayer_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Transfer Relayer stopped");
    Ok(())
}

/// Signing gateway plus the proof sent with every signing request
fn build_signer(config: &SignerConfig) -> Result<(Arc<dyn SigningGateway>, String)> {
    match config {
        SignerConfig::Custody {
            base_url,
            api_token,
            request_timeout_ms,
        } => {
            let signer = CustodyApiSigner::new(
                base_url.clone(),
                api_token.clone(),
                Duration::from_millis(*request_timeout_ms),
            )?;
            info!("Signing through custody service at {}", base_url);
            Ok((Arc::new(signer), api_token.clone()))
        }
        SignerConfig::Local { private_key_env } => {
            let key = std::env::var(private_key_env)
                .with_context(|| format!("Signer key variable {} is not set", private_key_env))?;
            let signer = LocalWalletSigner::from_private_key(&key)?;
            warn!(
                "Signing with a local key for {:?} - development networks only",
                signer.address()
            );
            Ok((Arc::new(signer), String::new()))
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,transfer_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
