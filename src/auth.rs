use crate::error::AppError;
use crate::handlers::request_id_from_headers;
use crate::models::Role;
use crate::state::AppState;
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks HS256 JWTs bound to a user id.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str, role: Role) -> String {
        let now = chrono::Utc::now().timestamp();
        self.issue_at(user_id, role, now)
    }

    pub fn issue_at(&self, user_id: &str, role: Role, issued_at: i64) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iat: issued_at,
            exp: issued_at + self.ttl.as_secs() as i64,
        };
        // Claims only holds strings and integers, serialization cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));
        format!("{signing_input}.{signature}")
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let raw_header = URL_SAFE_NO_PAD.decode(header).map_err(|_| TokenError::Malformed)?;
        let header: serde_json::Value =
            serde_json::from_slice(&raw_header).map_err(|_| TokenError::Malformed)?;
        if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
            return Err(TokenError::Malformed);
        }

        let raw_claims = URL_SAFE_NO_PAD.decode(payload).map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&raw_claims).map_err(|_| TokenError::Malformed)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac accepts any key length")
    }

    fn sign(&self, input: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(input);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Identity resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn require_teacher(&self, request_id: &str) -> Result<(), AppError> {
        if self.role != Role::Teacher {
            return Err(AppError::forbidden("teacher role required", request_id));
        }
        Ok(())
    }

    pub fn require_student(&self, request_id: &str) -> Result<(), AppError> {
        if self.role != Role::Student {
            return Err(AppError::forbidden("student role required", request_id));
        }
        Ok(())
    }
}

fn resolve_bearer(parts: &Parts, state: &AppState) -> Result<Option<CurrentUser>, AppError> {
    let req_id = request_id_from_headers(&parts.headers);
    if !parts.headers.contains_key(axum::http::header::AUTHORIZATION) {
        return Ok(None);
    }
    let Some(Authorization(bearer)) = parts.headers.typed_get::<Authorization<Bearer>>() else {
        return Err(AppError::unauthorized("expected a bearer token", req_id));
    };
    let claims = state
        .tokens
        .verify(bearer.token())
        .map_err(|e| AppError::unauthorized(e.to_string(), req_id))?;
    Ok(Some(CurrentUser {
        id: claims.sub,
        role: claims.role,
    }))
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve_bearer(parts, state)?.ok_or_else(|| {
            AppError::unauthorized("missing bearer token", request_id_from_headers(&parts.headers))
        })
    }
}

/// Like `CurrentUser` but tolerates an absent header. A present but invalid
/// token is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<CurrentUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(resolve_bearer(parts, state)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Duration::from_secs(600))
    }

    #[test]
    fn token_resolves_to_same_user() {
        let s = signer();
        let token = s.issue("s123", Role::Student);
        let claims = s.verify(&token).unwrap();
        assert_eq!(claims.sub, "s123");
        assert_eq!(claims.role, Role::Student);
    }

    #[test]
    fn expired_token_is_rejected() {
        let s = signer();
        let token = s.issue_at("s1", Role::Student, 1_000);
        assert_eq!(s.verify_at(&token, 1_000 + 600).unwrap_err(), TokenError::Expired);
        assert!(s.verify_at(&token, 1_000 + 599).is_ok());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let s = signer();
        let token = s.issue("s1", Role::Student);
        let forged_claims = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"t1","role":"TEACHER","iat":0,"exp":99999999999}"#,
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_claims;
        let forged = parts.join(".");
        assert_eq!(s.verify(&forged).unwrap_err(), TokenError::BadSignature);

        let other = TokenSigner::new("other-secret", Duration::from_secs(600));
        assert_eq!(other.verify(&token).unwrap_err(), TokenError::BadSignature);
        assert_eq!(s.verify("not-a-token").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }
}
