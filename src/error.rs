use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::notification::ReconcileErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("reconciliation failed:\n{0}")]
    Reconcile(#[from] ReconcileErrors),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Reconcile(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
