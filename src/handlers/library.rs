use super::ai::{resource_kind, source_host};
use super::{request_id_from_headers, validate_payload, AppJson};
use crate::auth::CurrentUser;
use crate::db;
use crate::error::{AppError, ResultExt};
use crate::models::{now_ms, StudyResource, Visual};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveVisualPayload {
    #[validate(required(message = "id is required"), length(min = 1, max = 120))]
    pub id: Option<String>,
    #[serde(rename = "type")]
    #[validate(required(message = "type is required"), length(min = 1, max = 40))]
    pub kind: Option<String>,
    #[validate(required(message = "title is required"), length(max = 300))]
    pub title: Option<String>,
    #[validate(required(message = "data is required"))]
    pub data: Option<Value>,
    pub created_at: Option<i64>,
}

pub async fn save_visual(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<SaveVisualPayload>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(id), Some(kind), Some(title), Some(data)) =
        (payload.id, payload.kind, payload.title, payload.data)
    else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let visual = Visual {
        id,
        kind,
        title,
        data,
        created_at: payload.created_at.unwrap_or_else(now_ms),
        student_id: user.id.clone(),
    };
    db::insert_visual(&state.db, &visual).await.req(&req_id)?;
    info!(student_id = %user.id, visual_id = %visual.id, "visual saved");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Visual saved successfully", "id": visual.id })),
    ))
}

pub async fn list_visuals(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<Visual>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_visuals(&state.db, &user.id).await.req(&req_id)?))
}

pub async fn delete_visual(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(visual_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    db::delete_visual(&state.db, &user.id, &visual_id)
        .await
        .req(&req_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaveResourcePayload {
    #[validate(length(min = 1, max = 120))]
    pub id: Option<String>,
    #[validate(required(message = "title is required"), length(min = 1, max = 500))]
    pub title: Option<String>,
    #[validate(required(message = "uri is required"), url(message = "uri must be an absolute url"))]
    pub uri: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub date_saved: Option<i64>,
}

pub async fn save_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<SaveResourcePayload>,
) -> Result<(StatusCode, Json<StudyResource>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(title), Some(uri)) = (payload.title, payload.uri) else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let resource = StudyResource {
        id: payload
            .id
            .unwrap_or_else(|| format!("res_{}", uuid::Uuid::new_v4())),
        source: payload.source.or_else(|| source_host(&uri)),
        kind: Some(payload.kind.unwrap_or_else(|| resource_kind(&uri).to_string())),
        date_saved: Some(payload.date_saved.unwrap_or_else(now_ms)),
        title,
        uri,
    };
    let (stored, created) = db::save_resource(&state.db, &user.id, &resource)
        .await
        .req(&req_id)?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(stored)))
}

pub async fn list_resources(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<StudyResource>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_resources(&state.db, &user.id).await.req(&req_id)?))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(resource_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    db::delete_resource(&state.db, &user.id, &resource_id)
        .await
        .req(&req_id)?;
    Ok(StatusCode::NO_CONTENT)
}
