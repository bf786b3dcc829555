use super::{request_id_from_headers, validate_payload, AppJson};
use crate::auth::{hash_password, verify_password, CurrentUser};
use crate::db::{self, ProfileUpdate};
use crate::error::{AppError, ResultExt};
use crate::models::{Role, UserBase};
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterPayload {
    #[validate(required(message = "name is required"), length(min = 1, max = 120))]
    pub name: Option<String>,
    #[validate(required(message = "email is required"), email(message = "email is not valid"))]
    pub email: Option<String>,
    #[validate(required(message = "password is required"), length(min = 1, max = 256))]
    pub password: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(max = 120))]
    pub subject: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Registered {
    pub message: &'static str,
    pub id: String,
}

async fn create_account(
    state: &AppState,
    payload: RegisterPayload,
    role: Role,
    req_id: &str,
) -> Result<String, AppError> {
    validate_payload(&payload, req_id)?;
    let (Some(name), Some(email), Some(password)) = (payload.name, payload.email, payload.password) else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let password_hash = hash_password(&password)
        .map_err(|_| AppError::internal("password hash failed", req_id))?;
    let prefix = match role {
        Role::Student => 's',
        Role::Teacher => 't',
    };
    let base = UserBase {
        id: format!("{prefix}{}", uuid::Uuid::new_v4()),
        name: name.trim().to_string(),
        email: email.trim().to_string(),
        phone: payload.phone.filter(|p| !p.trim().is_empty()),
        password_hash,
    };
    match role {
        Role::Student => db::insert_student(&state.db, &base).await.req(req_id)?,
        Role::Teacher => db::insert_teacher(&state.db, &base, payload.subject.as_deref())
            .await
            .req(req_id)?,
    }
    info!(user_id = %base.id, role = %role, "account registered");
    Ok(base.id)
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<RegisterPayload>,
) -> Result<(StatusCode, Json<Registered>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let id = create_account(&state, payload, Role::Student, &req_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(Registered {
            message: "Student registered successfully",
            id,
        }),
    ))
}

pub async fn register_teacher(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<RegisterPayload>,
) -> Result<(StatusCode, Json<Registered>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let id = create_account(&state, payload, Role::Teacher, &req_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(Registered {
            message: "Teacher registered successfully",
            id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LoginPayload {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenOut {
    pub access_token: String,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<LoginPayload>,
) -> Result<Json<TokenOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let (Some(email), Some(password)) = (
        payload.email.filter(|e| !e.trim().is_empty()),
        payload.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::unauthorized("missing email or password", req_id));
    };

    let user = db::find_user_by_email(&state.db, email.trim())
        .await
        .req(&req_id)?
        .ok_or_else(|| AppError::unauthorized("invalid credentials", req_id.clone()))?;
    if !verify_password(&password, &user.base().password_hash) {
        return Err(AppError::unauthorized("invalid credentials", req_id));
    }

    info!(user_id = %user.base().id, "login");
    Ok(Json(TokenOut {
        access_token: state.tokens.issue(&user.base().id, user.role()),
    }))
}

pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let found = db::find_user(&state.db, &user.id)
        .await
        .req(&req_id)?
        .ok_or_else(|| AppError::not_found("user not found", req_id))?;
    Ok(Json(found.summary()))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePayload {
    #[validate(length(min = 1, max = 120))]
    pub name: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(max = 2000))]
    pub bio: Option<String>,
    #[validate(length(max = 40))]
    pub preferred_language: Option<String>,
    #[validate(length(max = 80))]
    pub preferred_voice: Option<String>,
    #[validate(length(max = 120))]
    pub subject: Option<String>,
    #[validate(range(min = 0, max = 80))]
    pub years_of_experience: Option<i64>,
}

pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<ProfilePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let update = ProfileUpdate {
        name: payload.name.map(|n| n.trim().to_string()),
        phone: payload.phone,
        bio: payload.bio,
        preferred_language: payload.preferred_language,
        preferred_voice: payload.preferred_voice,
        subject: payload.subject,
        years_of_experience: payload.years_of_experience,
    };
    db::update_profile(&state.db, &user.id, user.role, &update)
        .await
        .req(&req_id)?;
    let found = db::find_user(&state.db, &user.id)
        .await
        .req(&req_id)?
        .ok_or_else(|| AppError::not_found("user not found", req_id))?;
    Ok(Json(found.summary()))
}
