//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and block heights
//! - Swap lifecycle transitions
//! - Watcher polling, errors and reorgs
//! - Signer submissions

use crate::coordination::{IntentAction, SwapRole, SwapState};
use crate::error::{SwapError, SwapResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "tesseract_htlc_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "tesseract_htlc_chain_block_height",
        "Latest block height per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_SAFE_HEIGHT: GaugeVec = register_gauge_vec!(
        "tesseract_htlc_chain_safe_height",
        "Highest block treated as irreversible per chain",
        &["chain_id"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS_INITIATED: CounterVec = register_counter_vec!(
        "tesseract_htlc_swaps_initiated_total",
        "Total swaps initiated by role",
        &["role"]
    ).unwrap();

    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "tesseract_htlc_swap_transitions_total",
        "Total swap state transitions",
        &["from", "to"]
    ).unwrap();

    // Watcher metrics
    pub static ref WATCHER_POLLS: CounterVec = register_counter_vec!(
        "tesseract_htlc_watcher_polls_total",
        "Total successful watcher polls",
        &["chain_id"]
    ).unwrap();

    pub static ref WATCHER_ERRORS: CounterVec = register_counter_vec!(
        "tesseract_htlc_watcher_errors_total",
        "Total failed watcher polls",
        &["chain_id"]
    ).unwrap();

    pub static ref REORGS_DETECTED: CounterVec = register_counter_vec!(
        "tesseract_htlc_reorgs_detected_total",
        "Total unconfirmed observations that disappeared from the chain",
        &["chain_id"]
    ).unwrap();

    // Signer metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "tesseract_htlc_submissions_total",
        "Total intents submitted to the signer",
        &["chain_id", "action", "result"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "tesseract_htlc_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "tesseract_htlc_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_tip(chain_id: u64, latest: u64, safe: u64) {
    let label = chain_id.to_string();
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&label])
        .set(latest as f64);
    CHAIN_SAFE_HEIGHT
        .with_label_values(&[&label])
        .set(safe as f64);
}

pub fn record_swap_initiated(role: SwapRole) {
    SWAPS_INITIATED.with_label_values(&[role.as_str()]).inc();
}

pub fn record_transition(from: SwapState, to: SwapState) {
    SWAP_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_watcher_poll(chain_id: u64) {
    WATCHER_POLLS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_watcher_error(chain_id: u64) {
    WATCHER_ERRORS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reorg(chain_id: u64) {
    REORGS_DETECTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_submission(chain_id: u64, action: IntentAction, success: bool) {
    let action = action.to_string();
    SUBMISSIONS
        .with_label_values(&[
            &chain_id.to_string(),
            &action,
            if success { "ok" } else { "error" },
        ])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
