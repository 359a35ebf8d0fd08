//! Operator metrics API
//!
//! Bearer-guarded router serving the aggregate datasets and the trace
//! dismiss operation. The server mounts it under `/apm`; dashboards poll
//! the dataset endpoints and render them directly.

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RequestUser;
use crate::error::ApmError;
use crate::instrument::Apm;

pub fn router(apm: Apm) -> Router {
    Router::new()
        .route("/metrics/requests-by-day", get(requests_by_day))
        .route("/metrics/requests-by-handler", get(requests_by_handler))
        .route("/metrics/latency-by-handler", get(latency_by_handler))
        .route("/metrics/latency-by-day", get(latency_by_day))
        .route("/metrics/requests-by-hour", get(requests_by_hour))
        .route("/metrics/errors-by-class", get(errors_by_class))
        .route("/traces/dismiss", post(dismiss_traces))
        .layer(middleware::from_fn_with_state(
            apm.clone(),
            admin_auth_middleware,
        ))
        .with_state(apm)
}

/// Bearer-token guard for the operator surface
///
/// The acting operator is attached as `RequestUser` so dismissals carry
/// attribution.
async fn admin_auth_middleware(
    State(apm): State<Apm>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApmError> {
    let header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApmError::Unauthorized("Missing Authorization header".to_string()))?;

    let token = extract_bearer_token(header)?;

    let config = apm.config();
    if config.admin.token.is_empty() || token != config.admin.token {
        return Err(ApmError::Unauthorized("Invalid admin token".to_string()));
    }

    request.extensions_mut().insert(RequestUser {
        username: "admin".to_string(),
    });

    Ok(next.run(request).await)
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(header: &str) -> Result<&str, ApmError> {
    const BEARER_PREFIX: &str = "Bearer ";

    if !header.starts_with(BEARER_PREFIX) {
        return Err(ApmError::Unauthorized(
            "Authorization header must use Bearer scheme".to_string(),
        ));
    }

    let token = &header[BEARER_PREFIX.len()..];
    if token.is_empty() {
        return Err(ApmError::Unauthorized("Bearer token is empty".to_string()));
    }

    Ok(token)
}

async fn requests_by_day(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().requests_by_day().await?))
}

async fn requests_by_handler(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().requests_by_handler_today().await?))
}

async fn latency_by_handler(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().latency_by_handler().await?))
}

async fn latency_by_day(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().latency_by_day().await?))
}

async fn requests_by_hour(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().requests_by_hour().await?))
}

async fn errors_by_class(State(apm): State<Apm>) -> Result<Json<Value>, ApmError> {
    Ok(Json(apm.store().errors_by_class().await?))
}

#[derive(Debug, Deserialize)]
struct DismissRequest {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DismissResponse {
    dismissed: u64,
}

/// Stamp the listed traces as handled. Already-dismissed traces keep their
/// original stamp and do not count toward the response.
async fn dismiss_traces(
    State(apm): State<Apm>,
    Extension(user): Extension<RequestUser>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<DismissResponse>, ApmError> {
    let dismissed = apm
        .store()
        .dismiss_traces(&request.ids, &user.username)
        .await?;
    Ok(Json(DismissResponse { dismissed }))
}
