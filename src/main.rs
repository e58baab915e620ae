//! Tesseract HTLC - cross-chain atomic swap coordinator
//!
//! Runs the swap coordinator against the configured chains, resumes swaps
//! left active by a previous run, and serves the swap API.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tesseract_htlc::api::{self, AppState};
use tesseract_htlc::chain::ChainRegistry;
use tesseract_htlc::clock::SystemClock;
use tesseract_htlc::config::Settings;
use tesseract_htlc::coordination::SwapCoordinator;
use tesseract_htlc::metrics::{self, MetricsServer};
use tesseract_htlc::state::{PgSwapStore, SwapStore};
use tesseract_htlc::tx::EvmSigner;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Tesseract HTLC v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.coordinator.instance_id
    );

    let store = Arc::new(PgSwapStore::new(&settings.database).await?);
    info!("Database connection established");
    store.run_migrations().await?;

    let chains = Arc::new(ChainRegistry::from_settings(&settings)?);
    info!("Chain connections initialized");

    let signer = Arc::new(EvmSigner::new(chains.clone(), settings.wallet.clone()).await?);
    info!("Signing as {:?}", signer.wallet_address());

    let coordinator = Arc::new(SwapCoordinator::new(
        chains.clone(),
        store.clone(),
        signer,
        Arc::new(SystemClock),
        settings.coordinator.clone(),
    ));

    let resumed = coordinator.resume_all().await?;
    info!("Resumed {} active swaps", resumed);

    for (state, total) in store.count_by_state().await? {
        info!("Stored swaps in state {}: {}", state, total);
    }

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            coordinator: coordinator.clone(),
            store: store.clone(),
            chains: chains.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

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

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let store = store.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chains.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Tesseract HTLC is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    if let Err(e) = coordinator.shutdown().await {
        error!("Failed to persist swaps on shutdown: {}", e);
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tesseract HTLC stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tesseract_htlc=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
