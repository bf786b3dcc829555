//! HTTP handlers, grouped by area. Shared plumbing (request ids, payload
//! validation, the time-boxed model call) lives here.

pub mod ai;
pub mod auth;
pub mod library;
pub mod students;
pub mod tutoring;

use crate::ai_client::{AiError, GenerateReply, GenerateRequest, SpeechRequest};
use crate::error::{AppError, ErrorDetail, ResultExt};
use crate::state::AppState;
use axum::extract::FromRequest;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Instant;
use tracing::warn;
use validator::Validate;

/// `Json` extractor whose rejections render as the usual error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub(crate) fn validate_payload<T: Validate>(payload: &T, request_id: &str) -> Result<(), AppError> {
    payload
        .validate()
        .map_err(|errors| AppError::from_validation(errors, request_id))
}

/// Rejects attachment data that is not standard base64 before it reaches
/// the model.
pub(crate) fn ensure_base64(field: &str, data: &str, request_id: &str) -> Result<(), AppError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() || STANDARD.decode(compact.as_bytes()).is_err() {
        return Err(AppError::validation("attachment is not valid base64", request_id).with_details(vec![
            ErrorDetail {
                field: field.to_string(),
                issue: "must be base64 encoded".to_string(),
            },
        ]));
    }
    Ok(())
}

pub(crate) async fn call_model(
    state: &AppState,
    request: GenerateRequest,
    request_id: &str,
) -> Result<GenerateReply, AppError> {
    let task = request.task;
    let limit = state.config.ai_timeout;
    let started = Instant::now();
    let outcome = match tokio::time::timeout(limit, state.ai.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(AiError::Timeout(limit)),
    };
    if let Err(err) = &outcome {
        warn!(
            task = %task,
            request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "AI call failed: {}",
            err
        );
    }
    outcome.req(request_id)
}

pub(crate) async fn call_speech(
    state: &AppState,
    request: SpeechRequest,
    request_id: &str,
) -> Result<Vec<u8>, AppError> {
    let limit = state.config.ai_timeout;
    let outcome = match tokio::time::timeout(limit, state.ai.synthesize_speech(request)).await {
        Ok(result) => result,
        Err(_) => Err(AiError::Timeout(limit)),
    };
    if let Err(err) = &outcome {
        warn!(request_id, "speech synthesis failed: {}", err);
    }
    outcome.req(request_id)
}
