use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing or invalid webhook secret")]
    Forbidden,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error(transparent)]
    Processing(#[from] anyhow::Error),
}

pub type WebhookResult<T> = Result<T, WebhookError>;

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::Forbidden => StatusCode::FORBIDDEN,
            WebhookError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WebhookError::Invalid(_) => StatusCode::BAD_REQUEST,
            WebhookError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            WebhookError::Processing(error) => error!("webhook processing failed: {error:#}"),
            other => warn!(%other, "webhook rejected"),
        }
        // internal details stay in the logs
        let body = match self {
            WebhookError::Processing(_) => "processing failed".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}
