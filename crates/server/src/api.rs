//! HTTP surface: health check and the "migrate collection" operation.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use unembed_engine::{CancelFlag, Filter, MigrationError, Orchestrator};
use unembed_protocol::{ApiResponse, MigrateRequest, MigrationStats};

use crate::auth::auth_middleware;
use crate::state::AppState;

const MAX_COLLECTION_NAME: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Unavailable(#[from] MigrationError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ApiResponse::<()>::err(self.to_string()))).into_response()
    }
}

pub fn router(state: AppState, auth_token: Option<String>) -> Router {
    let api = Router::new()
        .route("/api/migrations/{collection}", post(run_migration))
        .with_state(state);

    let mut app = Router::new().route("/health", get(health_handler)).merge(api);
    if let Some(token) = auth_token {
        app = app.layer(middleware::from_fn_with_state(
            Arc::<str>::from(token),
            auth_middleware,
        ));
    }

    app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn run_migration(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<MigrationStats>>, ApiError> {
    validate_collection(&collection)?;
    let request: MigrateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        MigrateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
    };

    let Ok(permit) = state.migration_lock.clone().try_lock_owned() else {
        return Err(ApiError::Conflict(
            "a migration is already in progress".to_string(),
        ));
    };

    // Dropping the request (client gone, deadline hit) stops the run between documents.
    let cancel = CancelFlag::new();
    let _cancel_on_drop = cancel.cancel_on_drop();

    info!(
        component = "api",
        event = "api.migration_requested",
        collection = %collection,
        filter_fields = request.filter.len(),
        "Migration requested"
    );

    let filter = Filter::from(request.filter);
    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        Orchestrator::new(state.store.as_ref(), state.sink.as_ref(), &state.rules)
            .with_clock(state.clock.clone())
            .with_cancel(cancel)
            .run(&collection, &filter)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("migration task failed: {e}")))?;

    Ok(Json(ApiResponse::ok(result?)))
}

/// Collection names become SQL parameters and log fields; keep them boring.
fn validate_collection(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_COLLECTION_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid collection name {name:?}")))
    }
}
