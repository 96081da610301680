//! Control API: the HTTP surface the spec requires without designing in
//! full (§6) -- `create_migration`, `get_migration`, `start`, `cancel`,
//! `list`. One [`Orchestrator`] is held per `StoreClass`; a request is
//! routed to the matching one by `store_class` on its `MigrationRequest`,
//! or by looking up the persisted request for an existing migration id.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use models::{ErrorClass, Id, Migration, MigrationFilter, MigrationRequest, MigrationState, ShardProgress, StoreClass};
use orchestrator::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use store_driver::StoreDriver;
use tower_http::trace::TraceLayer;

/// DynDriver type-erases the back-end a `StoreClass` is wired to, so one
/// `AppState` can hold a differently-backed `Orchestrator` per class (§9).
/// `StoreDriver` is object-safe, so `dyn StoreDriver` satisfies the
/// `Orchestrator<D: StoreDriver + ?Sized>` bound directly -- no wrapper type
/// needed.
pub type DynDriver = Arc<dyn StoreDriver>;
pub type DynOrchestrator = Orchestrator<dyn StoreDriver>;

pub struct AppState {
    pub orchestrators: HashMap<StoreClass, Arc<DynOrchestrator>>,
    pub status: Arc<dyn status_store::StatusStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no orchestrator configured for store class {0}")]
    UnknownStoreClass(StoreClass),
    #[error("migration {0} not found")]
    NotFound(Id),
    #[error(transparent)]
    Status(#[from] status_store::StatusError),
    #[error(transparent)]
    Engine(#[from] models::EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownStoreClass(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Status(err) => status_for_class(err.class()),
            ApiError::Engine(err) => status_for_class(err.class()),
        };
        let body = Json(serde_json::json!({"error": self.to_string()}));
        (status, body).into_response()
    }
}

fn status_for_class(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Transient | ErrorClass::Fatal => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Contention => StatusCode::CONFLICT,
        ErrorClass::Logical => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Structural => StatusCode::BAD_REQUEST,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/migrations", post(create_migration).get(list_migrations))
        .route("/migrations/:id", get(get_migration))
        .route("/migrations/:id/start", post(start_migration))
        .route("/migrations/:id/cancel", post(cancel_migration))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn orchestrator_for<'a>(
    state: &'a AppState,
    store_class: StoreClass,
) -> Result<&'a Arc<DynOrchestrator>, ApiError> {
    state
        .orchestrators
        .get(&store_class)
        .ok_or(ApiError::UnknownStoreClass(store_class))
}

#[derive(serde::Serialize)]
struct CreateResponse {
    migration_id: Id,
}

#[tracing::instrument(skip(state, request))]
async fn create_migration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MigrationRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let orchestrator = orchestrator_for(&state, request.store_class)?;
    let migration_id = orchestrator.create_migration(request).await?;
    Ok(Json(CreateResponse { migration_id }))
}

#[derive(serde::Serialize)]
struct MigrationView {
    migration: Migration,
    progress: Vec<ShardProgress>,
}

#[tracing::instrument(skip(state))]
async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Id>,
) -> Result<Json<MigrationView>, ApiError> {
    let migration = state
        .status
        .get_migration(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    let progress = state.status.list_progress(id).await?;
    Ok(Json(MigrationView { migration, progress }))
}

#[derive(serde::Serialize)]
struct StartResponse {
    state: MigrationState,
}

#[tracing::instrument(skip(state))]
async fn start_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Id>,
) -> Result<Json<StartResponse>, ApiError> {
    let request = state
        .status
        .get_request(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    let orchestrator = orchestrator_for(&state, request.store_class)?;
    let outcome = orchestrator.start(id).await?;
    Ok(Json(StartResponse { state: outcome }))
}

#[tracing::instrument(skip(state))]
async fn cancel_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Id>,
) -> Result<StatusCode, ApiError> {
    let request = state
        .status
        .get_request(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    let orchestrator = orchestrator_for(&state, request.store_class)?;
    orchestrator.cancel(id).await;
    Ok(StatusCode::ACCEPTED)
}

#[tracing::instrument(skip(state))]
async fn list_migrations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MigrationFilter>,
) -> Result<Json<Vec<Migration>>, ApiError> {
    let migrations = state.status.list_migrations(&filter).await?;
    Ok(Json(migrations))
}
