use super::request_id_from_headers;
use crate::db;
use crate::error::{AppError, ResultExt};
use crate::models::{ModuleStats, Sentiment, User};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: String,
    pub name: String,
    pub email: String,
    pub mastery_score: i64,
    pub topics_completed: i64,
    pub at_risk: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDetail {
    #[serde(flatten)]
    pub summary: StudentSummary,
    pub sentiment_trend: Vec<Sentiment>,
    pub modules: Vec<ModuleStats>,
}

fn split(user: User) -> Option<(StudentSummary, Vec<Sentiment>)> {
    match user {
        User::Student { base, profile } => Some((
            StudentSummary {
                id: base.id,
                name: base.name,
                email: base.email,
                mastery_score: profile.mastery_score,
                topics_completed: profile.topics_completed,
                at_risk: profile.at_risk,
            },
            profile.sentiment_trend,
        )),
        User::Teacher { .. } => None,
    }
}

pub async fn list_students(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<StudentSummary>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let students = db::list_students(&state.db).await.req(&req_id)?;
    Ok(Json(
        students
            .into_iter()
            .filter_map(split)
            .map(|(summary, _)| summary)
            .collect(),
    ))
}

pub async fn get_student(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(student_id): Path<String>,
) -> Result<Json<StudentDetail>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let (summary, sentiment_trend) = db::find_student(&state.db, &student_id)
        .await
        .req(&req_id)?
        .and_then(split)
        .ok_or_else(|| AppError::not_found("student not found", req_id.clone()))?;
    let modules = db::list_modules(&state.db, &student_id).await.req(&req_id)?;
    Ok(Json(StudentDetail {
        summary,
        sentiment_trend,
        modules,
    }))
}
