//! HTTP API for health checks and swap management

use crate::chain::ChainRegistry;
use crate::config::ApiConfig;
use crate::coordination::{
    StateTransition, Submission, SwapCoordinator, SwapId, SwapParams, SwapRecord, SwapRole,
};
use crate::error::{SwapError, SwapResult};
use crate::hashlock::{self, Hashlock};
use crate::state::SwapStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
    pub store: Arc<dyn SwapStore>,
    pub chains: Arc<ChainRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/swaps", get(list_swaps).post(create_swap))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/cancel", post(cancel_swap))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Config(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| SwapError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);
    let ready = db_ok && chains_ok;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database: db_ok,
            chains: chains_ok,
            running_swaps: state.coordinator.running(),
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

async fn list_swaps(State(state): State<AppState>) -> Result<Json<Vec<SwapView>>, ApiError> {
    let records = state.coordinator.list_active().await?;
    Ok(Json(records.iter().map(SwapView::from).collect()))
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let id = SwapId::from_str(&id)?;
    let record = state.coordinator.get(&id).await?;
    Ok(Json(SwapView::from(&record)))
}

async fn create_swap(
    State(state): State<AppState>,
    Json(request): Json<CreateSwapRequest>,
) -> Result<(StatusCode, Json<SwapView>), ApiError> {
    let params = request.into_params()?;
    let record = state.coordinator.initiate(params).await?;
    Ok((StatusCode::CREATED, Json(SwapView::from(&record))))
}

async fn cancel_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let id = SwapId::from_str(&id)?;
    let record = state.coordinator.cancel(&id).await?;
    Ok(Json(SwapView::from(&record)))
}

/// Error body for failed requests
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(err: SwapError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwapError::SwapNotFound { .. } | SwapError::ChainNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            SwapError::Config(_) | SwapError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Request and response types

/// Body of `POST /swaps`. Amounts are decimal strings in the smallest
/// unit; timelocks are unix seconds.
#[derive(Debug, Deserialize)]
pub struct CreateSwapRequest {
    pub role: SwapRole,
    pub swap_id: Option<String>,
    pub hashlock: Option<String>,
    pub source_chain: u64,
    pub dest_chain: u64,
    pub amount: String,
    pub dest_amount: String,
    pub source_timelock: u64,
    pub dest_timelock: u64,
    pub source_recipient: Address,
    pub dest_recipient: Address,
    /// Block a counterparty starts scanning from for the initiator's lock
    #[serde(default)]
    pub source_from_block: Option<u64>,
}

impl CreateSwapRequest {
    fn into_params(self) -> SwapResult<SwapParams> {
        Ok(SwapParams {
            role: self.role,
            swap_id: self.swap_id.as_deref().map(SwapId::from_str).transpose()?,
            hashlock: self.hashlock.as_deref().map(Hashlock::from_str).transpose()?,
            source_chain: self.source_chain,
            dest_chain: self.dest_chain,
            amount: hashlock::parse_amount(&self.amount)?,
            dest_amount: hashlock::parse_amount(&self.dest_amount)?,
            source_timelock: hashlock::timelock_from_secs(self.source_timelock)?,
            dest_timelock: hashlock::timelock_from_secs(self.dest_timelock)?,
            source_recipient: self.source_recipient,
            dest_recipient: self.dest_recipient,
            source_from_block: self.source_from_block,
        })
    }
}

/// Public view of a swap. The secret only appears once it is on chain.
#[derive(Debug, Serialize)]
pub struct SwapView {
    pub id: String,
    pub role: SwapRole,
    pub state: String,
    pub hashlock: String,
    pub hash_function: String,
    pub source_chain: u64,
    pub dest_chain: u64,
    pub amount: String,
    pub dest_amount: String,
    pub source_timelock: DateTime<Utc>,
    pub dest_timelock: DateTime<Utc>,
    pub source_recipient: Address,
    pub dest_recipient: Address,
    pub secret: Option<String>,
    pub source_lock_tx: Option<H256>,
    pub dest_lock_tx: Option<H256>,
    pub submissions: Vec<Submission>,
    pub history: Vec<StateTransition>,
    pub failure: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SwapRecord> for SwapView {
    fn from(record: &SwapRecord) -> Self {
        let secret = if record.secret_is_public() {
            record.secret.as_ref().map(|s| s.to_hex())
        } else {
            None
        };

        Self {
            id: record.id.to_string(),
            role: record.role,
            state: record.state.to_string(),
            hashlock: record.hashlock.to_string(),
            hash_function: record.hash_function.to_string(),
            source_chain: record.source.chain_id,
            dest_chain: record.dest.chain_id,
            amount: record.amount.to_string(),
            dest_amount: record.dest_amount.to_string(),
            source_timelock: record.source_timelock,
            dest_timelock: record.dest_timelock,
            source_recipient: record.source_recipient,
            dest_recipient: record.dest_recipient,
            secret,
            source_lock_tx: record.source_lock.as_ref().map(|o| o.entry.tx_hash),
            dest_lock_tx: record.dest_lock.as_ref().map(|o| o.entry.tx_hash),
            submissions: record.submissions.clone(),
            history: record.history.clone(),
            failure: record.failure.clone(),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    running_swaps: usize,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainHandle;
    use crate::config::CoordinatorConfig;
    use crate::coordination::record::tests::sample_record;
    use crate::coordination::SwapState;
    use crate::hashlock::HashFunction;
    use crate::state::MemorySwapStore;
    use crate::testing::{ChainSigner, ManualClock, MockChain};

    fn app_state() -> (AppState, Arc<MockChain>) {
        let source = MockChain::new(1, 2);
        let dest = MockChain::new(2, 2);
        let chains = ChainRegistry::new();
        for (chain, contract) in [(&source, 0xaa), (&dest, 0xbb)] {
            chains.register(ChainHandle {
                name: format!("chain-{}", contract),
                reader: chain.clone(),
                contract: Address::from_low_u64_be(contract),
                hash_function: HashFunction::Sha256,
            });
        }
        let chains = Arc::new(chains);
        let store: Arc<MemorySwapStore> = Arc::new(MemorySwapStore::new());
        let signer = ChainSigner::new(Address::from_low_u64_be(0x11), &[source.clone(), dest]);
        let coordinator = Arc::new(SwapCoordinator::new(
            chains.clone(),
            store.clone(),
            signer,
            ManualClock::new(Utc::now()),
            CoordinatorConfig::default(),
        ));

        (
            AppState {
                coordinator,
                store,
                chains,
            },
            source,
        )
    }

    #[test]
    fn test_view_hides_secret_until_public() {
        let mut record = sample_record(SwapRole::Initiator);
        record.state = SwapState::DestLocked;
        assert!(SwapView::from(&record).secret.is_none());

        record.state = SwapState::SecretRevealed;
        let view = SwapView::from(&record);
        assert_eq!(view.secret, record.secret.as_ref().map(|s| s.to_hex()));
        assert_eq!(view.amount, "100");
    }

    #[test]
    fn test_error_status_codes() {
        let not_found = ApiError(SwapError::SwapNotFound {
            swap_id: "0x01".into(),
        })
        .into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let bad = ApiError(SwapError::Config("margin".into())).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_and_fetch_swap() {
        let (state, _) = app_state();
        let now = Utc::now().timestamp() as u64;

        let request = CreateSwapRequest {
            role: SwapRole::Initiator,
            swap_id: None,
            hashlock: None,
            source_chain: 1,
            dest_chain: 2,
            amount: "1000".to_string(),
            dest_amount: "990".to_string(),
            source_timelock: now + 7200,
            dest_timelock: now + 3600,
            source_recipient: Address::from_low_u64_be(0x22),
            dest_recipient: Address::from_low_u64_be(0x11),
            source_from_block: None,
        };

        let (status, Json(created)) = create_swap(State(state.clone()), Json(request))
            .await
            .map_err(|e| e.0)
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(created.secret.is_none());
        assert_eq!(created.amount, "1000");

        let Json(fetched) = get_swap(State(state.clone()), Path(created.id.clone()))
            .await
            .map_err(|e| e.0)
            .unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(fetched.secret.is_none());

        let Json(cancelled) = cancel_swap(State(state.clone()), Path(created.id.clone()))
            .await
            .map_err(|e| e.0)
            .unwrap();
        assert_eq!(cancelled.id, created.id);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_amount() {
        let (state, _) = app_state();
        let now = Utc::now().timestamp() as u64;
        let request = CreateSwapRequest {
            role: SwapRole::Initiator,
            swap_id: None,
            hashlock: None,
            source_chain: 1,
            dest_chain: 2,
            amount: "lots".to_string(),
            dest_amount: "990".to_string(),
            source_timelock: now + 7200,
            dest_timelock: now + 3600,
            source_recipient: Address::from_low_u64_be(0x22),
            dest_recipient: Address::from_low_u64_be(0x11),
            source_from_block: None,
        };

        let err = create_swap(State(state), Json(request)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_swap() {
        let (state, _) = app_state();
        let id = SwapId([7u8; 32]).to_string();
        let err = get_swap(State(state), Path(id)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
