use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::post,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::info;

use crate::error::{WebhookError, WebhookResult};
use crate::processor::Processor;

/// ----------------------------------------------------------------------
/// Shared app state
/// ----------------------------------------------------------------------
pub struct AppState {
    pub processor: Processor,
    /// Shared secret Zendesk appends to the webhook url
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    secret: Option<String>,
}

pub fn router(state: AppState, webhook_path: &str) -> Router {
    Router::new()
        .route(webhook_path, post(webhook))
        .with_state(Arc::new(state))
}

type HmacSha256 = Hmac<Sha256>;

/// Compares both secrets through their HMAC under the expected secret, so the
/// check takes the same time wherever the given value first differs.
fn secret_matches(expected: &str, given: Option<&str>) -> bool {
    let Some(given) = given else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let mac = |value: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (mac(expected), mac(given)) {
        (Ok(expected), Ok(given)) => given.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

/// ----------------------------------------------------------------------
/// Handler
/// ----------------------------------------------------------------------
#[tracing::instrument(skip_all)]
async fn webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    body: String,
) -> WebhookResult<StatusCode> {
    if !secret_matches(&state.secret, query.secret.as_deref()) {
        return Err(WebhookError::Forbidden);
    }

    let signal = state.processor.handle(&body).await?;
    info!(
        "Webhook for ticket {} handled as {}",
        signal.ticket().zendesk_id,
        signal.name()
    );
    Ok(StatusCode::OK)
}
