use axum::{http::StatusCode, routing::post, Extension, Router};

use crate::error::AppResult;
use crate::notification::Handler;

pub fn admin_routes() -> Router {
    Router::new().route("/api/notifications/reconcile", post(reconcile_notifications))
}

/// Runs one reconciliation pass synchronously. Per-event failures come back as a 500 with one
/// error per line.
pub async fn reconcile_notifications(
    Extension(handler): Extension<Handler>,
) -> AppResult<StatusCode> {
    handler.reconcile().await?;
    Ok(StatusCode::NO_CONTENT)
}
