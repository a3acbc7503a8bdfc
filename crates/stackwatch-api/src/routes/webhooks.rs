//! Build trigger webhook.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use stackwatch_core::{JobRecord, StackName};
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/trigger", post(trigger))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(alias = "name")]
    pub stack: String,
}

/// Request a build of a stack. A build already running for it is killed
/// once the new request is dispatched.
async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!("Rejected webhook with invalid signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let request: TriggerRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let name = StackName::new(request.stack)?;

    let record = state.store.submit(&name).await?;
    info!(stack = %name, "Webhook trigger accepted");
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// Check a `sha256=<hex>` HMAC of the raw body.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
