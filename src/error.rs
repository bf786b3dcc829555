use crate::ai_client::AiError;
use crate::auth::TokenError;
use crate::db::StoreError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use validator::ValidationErrors;

/// One offending input field.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

/// Error taxonomy exposed to clients. Service failures share a status but
/// keep their own code so callers can tell a timeout from a bad reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Unauthorized,
    Forbidden,
    NotFound,
    Service(&'static str),
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation | ErrorKind::Conflict => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Service(code) => code,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    fn of(kind: ErrorKind, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn validation(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::Validation, message, request_id)
    }

    pub fn conflict(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::Conflict, message, request_id)
    }

    pub fn unauthorized(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::Unauthorized, message, request_id)
    }

    pub fn forbidden(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::Forbidden, message, request_id)
    }

    pub fn not_found(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::NotFound, message, request_id)
    }

    pub fn service(code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::of(ErrorKind::Service(code), message, request_id)
    }

    pub fn internal(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::service("INTERNAL_ERROR", message, request_id)
    }

    pub fn from_validation(errors: ValidationErrors, request_id: impl Into<String>) -> Self {
        let mut details: Vec<ErrorDetail> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| ErrorDetail {
                    field: field.to_string(),
                    issue: e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string()),
                })
            })
            .collect();
        details.sort_by(|a, b| a.field.cmp(&b.field));
        Self::validation("missing or invalid fields", request_id).with_details(details)
    }
}

impl From<AiError> for AppError {
    fn from(err: AiError) -> Self {
        let code = match &err {
            AiError::Timeout(_) => "AI_TIMEOUT",
            AiError::QuotaExhausted => "AI_QUOTA_EXHAUSTED",
            AiError::Transport(_) | AiError::Upstream { .. } => "AI_UNAVAILABLE",
            AiError::MalformedReply(_) | AiError::EmptyReply => "AI_INVALID_RESPONSE",
            AiError::NotConfigured => "AI_NOT_CONFIGURED",
        };
        Self::service(code, err.to_string(), String::new())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::not_found(format!("{what} not found"), String::new()),
            StoreError::Conflict(what) => Self::conflict(what, String::new()),
            StoreError::Database(e) => {
                tracing::error!("database error: {}", e);
                Self::service("DATABASE_ERROR", "database error", String::new())
            }
            StoreError::Corrupt(what) => {
                tracing::error!("corrupt row: {}", what);
                Self::service("DATABASE_ERROR", "database error", String::new())
            }
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        Self::unauthorized(err.to_string(), String::new())
    }
}

/// Body that axum could not turn into the payload type: wrong content type,
/// broken JSON or a field of the wrong type. The extractor runs before the
/// handler reads headers, so the rejection gets a fresh request id.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let issue = match &rejection {
            JsonRejection::MissingJsonContentType(_) => "expected an application/json body",
            JsonRejection::JsonSyntaxError(_) => "body is not valid JSON",
            JsonRejection::JsonDataError(_) => "body does not match the expected shape",
            _ => "body could not be read",
        };
        Self::validation(rejection.body_text(), uuid::Uuid::new_v4().to_string()).with_details(vec![ErrorDetail {
            field: "body".to_string(),
            issue: issue.to_string(),
        }])
    }
}

/// Attaches the request id to errors converted with `?`.
pub trait ResultExt<T> {
    fn req(self, request_id: &str) -> Result<T, AppError>;
}

impl<T, E: Into<AppError>> ResultExt<T> for Result<T, E> {
    fn req(self, request_id: &str) -> Result<T, AppError> {
        self.map_err(|e| {
            let mut err: AppError = e.into();
            err.request_id = request_id.to_string();
            err
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "no_details")]
    details: &'a [ErrorDetail],
    request_id: &'a str,
}

fn no_details(details: &&[ErrorDetail]) -> bool {
    details.is_empty()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(Envelope {
            error: EnvelopeBody {
                code: self.code(),
                message: &self.message,
                details: &self.details,
                request_id: &self.request_id,
            },
        })
        .into_response();
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_and_code() {
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Conflict.code(), "CONFLICT");
        let err: AppError = AiError::Timeout(std::time::Duration::from_secs(1)).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "AI_TIMEOUT");
    }

    #[test]
    fn request_id_is_attached() {
        let result: Result<(), StoreError> = Err(StoreError::NotFound("student"));
        let err = result.req("rid-1").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.message, "student not found");
        assert_eq!(err.request_id, "rid-1");
    }
}
