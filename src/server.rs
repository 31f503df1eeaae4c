//! HTTP tool and admin surface.
//!
//! Exposes the four tools plus the admin endpoints over JSON on localhost.
//! All endpoints delegate to the dispatcher; error responses carry the
//! `{kind, message, retryable}` shape.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::dispatch::{
    GetContextRequest, LogEventRequest, LogInsightRequest, SubmitQueryRequest, ToolDispatcher,
};
use crate::error::RelayError;

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Validation { .. } => StatusCode::BAD_REQUEST,
            RelayError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Backpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::NoAvailableAccount
            | RelayError::CircuitOpen { .. }
            | RelayError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Warehouse { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::debug!(kind = self.kind(), status = %status, "tool error response");

        let body = json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type AppState = Arc<ToolDispatcher>;

/// Build the tool + admin router.
pub fn router(dispatcher: Arc<ToolDispatcher>) -> Router {
    Router::new()
        .route("/tools/log_event", post(log_event))
        .route("/tools/get_context", post(get_context))
        .route("/tools/submit_query", post(submit_query))
        .route("/tools/log_insight", post(log_insight))
        .route("/tickets/:id", get(ticket_status))
        .route("/tickets/:id/cancel", post(ticket_cancel))
        .route("/admin/health", get(admin_health))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/unlock_account", post(admin_unlock))
        .route("/admin/rotate_credentials", post(admin_rotate))
        .with_state(dispatcher)
}

/// Serve until the shutdown signal resolves.
pub async fn serve(
    dispatcher: Arc<ToolDispatcher>,
    bind_addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "tool surface listening");
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn log_event(
    State(dispatcher): State<AppState>,
    Json(request): Json<LogEventRequest>,
) -> Result<Json<Value>, RelayError> {
    dispatcher.log_event(request).await.map(Json)
}

async fn get_context(
    State(dispatcher): State<AppState>,
    Json(request): Json<GetContextRequest>,
) -> Result<Json<Value>, RelayError> {
    dispatcher.get_context(request).await.map(Json)
}

async fn submit_query(
    State(dispatcher): State<AppState>,
    Json(request): Json<SubmitQueryRequest>,
) -> Result<Json<Value>, RelayError> {
    dispatcher.submit_query(request).await.map(Json)
}

async fn log_insight(
    State(dispatcher): State<AppState>,
    Json(request): Json<LogInsightRequest>,
) -> Result<Json<Value>, RelayError> {
    dispatcher.log_insight(request).await.map(Json)
}

async fn ticket_status(
    State(dispatcher): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match dispatcher.ticket_status(&id) {
        Some(ticket) => Ok(Json(json!(ticket))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn ticket_cancel(
    State(dispatcher): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let cancelled = dispatcher.cancel_ticket(&id);
    Json(json!({ "ticketId": id, "cancelled": cancelled }))
}

async fn admin_health(State(dispatcher): State<AppState>) -> Json<Value> {
    match dispatcher.health() {
        Some(health) => Json(json!(health)),
        None => Json(json!({ "overall": "healthy", "note": "layer does not track health" })),
    }
}

async fn admin_stats(State(dispatcher): State<AppState>) -> Json<Value> {
    Json(dispatcher.stats())
}

#[derive(Debug, Deserialize)]
struct UnlockRequest {
    username: String,
}

async fn admin_unlock(
    State(dispatcher): State<AppState>,
    Json(request): Json<UnlockRequest>,
) -> Result<Json<Value>, StatusCode> {
    if dispatcher.unlock_account(&request.username) {
        Ok(Json(json!({ "username": request.username, "unlocked": true })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn admin_rotate(State(dispatcher): State<AppState>) -> Json<Value> {
    Json(json!({ "preferred": dispatcher.rotate_credentials() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let err = RelayError::validation("customerKey", "bad charset");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::Backpressure {
                pending: 1,
                limit: 1
            }
            .into_response()
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RelayError::timeout("warehouse call", 30_000)
                .into_response()
                .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::NoAvailableAccount.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::warehouse("boom").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
