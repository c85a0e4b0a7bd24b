use crate::db::list_statuses;
use crate::model::DeviceStatusResponse;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::error;

#[derive(Debug, Clone)]
struct AppState {
    pool: PgPool,
}

#[derive(Debug, Deserialize)]
pub struct DeviceStatusQuery {
    device_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn create_router(pool: PgPool) -> Router {
    let state = AppState { pool };

    Router::new()
        .route("/api/v1/device-status", get(get_device_status))
        .with_state(state)
}

async fn get_device_status(
    State(state): State<AppState>,
    Query(params): Query<DeviceStatusQuery>,
) -> Result<Json<DeviceStatusResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    let statuses = list_statuses(&state.pool, params.device_id.as_deref(), limit, offset)
        .await
        .map_err(|e| AppError(anyhow::anyhow!("Database query failed: {}", e)))?;

    Ok(Json(DeviceStatusResponse {
        total: statuses.len(),
        data: statuses,
        limit,
        offset,
    }))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
