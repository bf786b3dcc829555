//! Conversations, modules, quiz attempts, live sessions and the teacher
//! dashboard. Student records are always scoped to the caller.

use super::{request_id_from_headers, validate_payload, AppJson};
use crate::auth::CurrentUser;
use crate::db;
use crate::error::{AppError, ErrorDetail, ResultExt};
use crate::models::{
    derive_intervention, now_ms, Attachment, ChatConversation, ChatMessage, InterventionFlag,
    LiveSession, ModuleStats, QuizAttempt, QuizQuestion, TeacherMessage, TranscriptItem, User,
};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use validator::Validate;

const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

// -------------------------------------------------------- conversations

#[derive(Debug, Default, Deserialize, Validate)]
pub struct NewConversationPayload {
    #[validate(length(max = 200))]
    pub title: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    payload: Option<AppJson<NewConversationPayload>>,
) -> Result<(StatusCode, Json<ChatConversation>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    let payload = payload.map(|AppJson(p)| p).unwrap_or_default();
    validate_payload(&payload, &req_id)?;

    let now = now_ms();
    let conversation = ChatConversation {
        id: format!("conv_{}", uuid::Uuid::new_v4()),
        title: payload
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string()),
        summary: None,
        created_at: now,
        updated_at: now,
        messages: Some(Vec::new()),
    };
    db::insert_conversation(&state.db, &user.id, &conversation)
        .await
        .req(&req_id)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<ChatConversation>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_conversations(&state.db, &user.id).await.req(&req_id)?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<ChatConversation>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(
        db::find_conversation(&state.db, &user.id, &conversation_id)
            .await
            .req(&req_id)?,
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct NewMessagePayload {
    pub id: Option<String>,
    #[validate(required(message = "role is required"), custom(function = "validate_message_role"))]
    pub role: Option<String>,
    #[validate(required(message = "content is required"))]
    pub content: Option<String>,
    pub timestamp: Option<i64>,
    pub attachment: Option<Attachment>,
}

fn validate_message_role(role: &str) -> Result<(), validator::ValidationError> {
    match role {
        "user" | "model" => Ok(()),
        _ => Err(validator::ValidationError::new("role").with_message("role must be user or model".into())),
    }
}

pub async fn append_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
    AppJson(payload): AppJson<NewMessagePayload>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(role), Some(content)) = (payload.role, payload.content) else {
        return Err(AppError::validation("missing required fields", req_id));
    };
    if let Some(attachment) = &payload.attachment {
        super::ensure_base64("attachment.data", &attachment.data, &req_id)?;
    }

    let message = ChatMessage {
        id: payload
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4())),
        role,
        content,
        timestamp: payload.timestamp.unwrap_or_else(now_ms),
        attachment: payload.attachment,
    };
    db::append_message(&state.db, &user.id, &conversation_id, &message)
        .await
        .req(&req_id)?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RenamePayload {
    #[validate(required(message = "title is required"), length(min = 1, max = 200))]
    pub title: Option<String>,
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
    AppJson(payload): AppJson<RenamePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let title = payload.title.unwrap_or_default().trim().to_string();
    if title.is_empty() {
        return Err(AppError::validation("title must not be blank", req_id));
    }
    db::rename_conversation(&state.db, &user.id, &conversation_id, &title)
        .await
        .req(&req_id)?;
    Ok(Json(json!({ "id": conversation_id, "title": title })))
}

// -------------------------------------------------------------- modules

pub async fn list_modules(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<ModuleStats>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_modules(&state.db, &user.id).await.req(&req_id)?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AiModulePayload {
    #[validate(required(message = "topic is required"), length(min = 1, max = 200))]
    pub topic: Option<String>,
    #[validate(required(message = "questions are required"), length(min = 1, max = 50))]
    pub questions: Option<Vec<QuizQuestion>>,
}

#[derive(Debug, Serialize)]
pub struct CreatedModule {
    pub module: ModuleStats,
    pub questions: usize,
}

pub async fn create_ai_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<AiModulePayload>,
) -> Result<(StatusCode, Json<CreatedModule>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(topic), Some(questions)) = (payload.topic, payload.questions) else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let issues: Vec<ErrorDetail> = questions
        .iter()
        .enumerate()
        .filter_map(|(i, q)| {
            q.validate().err().map(|issue| ErrorDetail {
                field: format!("questions[{i}]"),
                issue,
            })
        })
        .collect();
    if !issues.is_empty() {
        return Err(AppError::validation("invalid questions", req_id).with_details(issues));
    }

    let topic = topic.trim().to_string();
    let module = db::insert_module_with_questions(&state.db, &user.id, &topic, &questions)
        .await
        .req(&req_id)?;
    info!(student_id = %user.id, module_id = %module.id, questions = questions.len(), "ai module created");
    Ok((
        StatusCode::CREATED,
        Json(CreatedModule {
            module,
            questions: questions.len(),
        }),
    ))
}

pub async fn module_questions(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(module_id): Path<String>,
) -> Result<Json<Vec<QuizQuestion>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(
        db::module_questions(&state.db, &user.id, &module_id)
            .await
            .req(&req_id)?,
    ))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    #[serde(default)]
    #[validate(range(min = -100, max = 100))]
    pub score_delta: i64,
    #[serde(default)]
    #[validate(range(min = 0, max = 86_400))]
    pub time_spent_delta: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressOut {
    pub modules: Vec<ModuleStats>,
    pub mastery_score: i64,
    pub topics_completed: i64,
}

pub async fn record_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    Path(module_id): Path<String>,
    AppJson(payload): AppJson<ProgressPayload>,
) -> Result<Json<ProgressOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (modules, summary) = db::apply_progress(
        &state.db,
        &user.id,
        &module_id,
        payload.score_delta,
        payload.time_spent_delta,
    )
    .await
    .req(&req_id)?;
    Ok(Json(ProgressOut {
        modules,
        mastery_score: summary.mastery_score,
        topics_completed: summary.topics_completed,
    }))
}

// -------------------------------------------------------- quiz attempts

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_attempt_scores"))]
pub struct AttemptPayload {
    #[validate(required(message = "moduleId is required"), length(min = 1))]
    pub module_id: Option<String>,
    #[validate(required(message = "score is required"), range(min = 0))]
    pub score: Option<i64>,
    #[validate(required(message = "maxScore is required"), range(min = 1))]
    pub max_score: Option<i64>,
    pub date: Option<i64>,
}

fn validate_attempt_scores(payload: &AttemptPayload) -> Result<(), validator::ValidationError> {
    match (payload.score, payload.max_score) {
        (Some(score), Some(max)) if score > max => Err(validator::ValidationError::new("score")
            .with_message("score must not exceed maxScore".into())),
        _ => Ok(()),
    }
}

pub async fn record_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<AttemptPayload>,
) -> Result<(StatusCode, Json<QuizAttempt>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(module_id), Some(score), Some(max_score)) = (payload.module_id, payload.score, payload.max_score)
    else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let attempt = QuizAttempt {
        id: format!("att_{}", uuid::Uuid::new_v4()),
        date: payload.date.unwrap_or_else(now_ms),
        module_id,
        score,
        max_score,
    };
    db::insert_attempt(&state.db, &user.id, &attempt)
        .await
        .req(&req_id)?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

pub async fn list_attempts(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<QuizAttempt>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_attempts(&state.db, &user.id).await.req(&req_id)?))
}

// -------------------------------------------------------- live sessions

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_session_window"))]
pub struct LiveSessionPayload {
    pub id: Option<String>,
    #[validate(required(message = "startTime is required"))]
    pub start_time: Option<i64>,
    #[validate(required(message = "endTime is required"))]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub transcript: Vec<TranscriptItem>,
}

fn validate_session_window(payload: &LiveSessionPayload) -> Result<(), validator::ValidationError> {
    match (payload.start_time, payload.end_time) {
        (Some(start), Some(end)) if end < start => Err(validator::ValidationError::new("endTime")
            .with_message("endTime must not precede startTime".into())),
        _ => Ok(()),
    }
}

pub async fn record_live_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<LiveSessionPayload>,
) -> Result<(StatusCode, Json<LiveSession>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(start_time), Some(end_time)) = (payload.start_time, payload.end_time) else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let session = LiveSession {
        id: payload
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("live_{}", uuid::Uuid::new_v4())),
        start_time,
        end_time,
        transcript: payload.transcript,
    };
    db::insert_live_session(&state.db, &user.id, &session)
        .await
        .req(&req_id)?;
    info!(student_id = %user.id, session_id = %session.id, items = session.transcript.len(), "live session stored");
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_live_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<LiveSession>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_live_sessions(&state.db, &user.id).await.req(&req_id)?))
}

// -------------------------------------------------------------- teacher

/// Stored flags first, then one derived flag per student whose standing
/// warrants it and who has no stored flag yet.
pub(crate) fn merge_interventions(stored: Vec<InterventionFlag>, students: &[User], now: i64) -> Vec<InterventionFlag> {
    let flagged: HashSet<String> = stored.iter().map(|f| f.student_id.clone()).collect();
    let derived: Vec<InterventionFlag> = students
        .iter()
        .filter_map(|user| match user {
            User::Student { base, profile } if !flagged.contains(&base.id) => {
                derive_intervention(&base.id, &base.name, profile.mastery_score, profile.at_risk, now)
            }
            _ => None,
        })
        .collect();
    stored.into_iter().chain(derived).collect()
}

pub async fn list_interventions(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<InterventionFlag>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_teacher(&req_id)?;
    let stored = db::list_flags(&state.db).await.req(&req_id)?;
    let students = db::list_students(&state.db).await.req(&req_id)?;
    Ok(Json(merge_interventions(stored, &students, now_ms())))
}

pub async fn list_decision_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_teacher(&req_id)?;
    let logs = db::list_decision_logs(&state.db).await.req(&req_id)?;
    Ok(Json(json!(logs)))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TeacherMessagePayload {
    #[validate(required(message = "studentId is required"), length(min = 1))]
    pub student_id: Option<String>,
    #[validate(required(message = "content is required"), length(min = 1, max = 4000))]
    pub content: Option<String>,
}

pub async fn send_teacher_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
    AppJson(payload): AppJson<TeacherMessagePayload>,
) -> Result<(StatusCode, Json<TeacherMessage>), AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_teacher(&req_id)?;
    validate_payload(&payload, &req_id)?;
    let (Some(student_id), Some(content)) = (payload.student_id, payload.content) else {
        return Err(AppError::validation("missing required fields", req_id));
    };

    let teacher = db::find_user(&state.db, &user.id)
        .await
        .req(&req_id)?
        .ok_or_else(|| AppError::not_found("user not found", req_id.clone()))?;
    let message = TeacherMessage {
        id: format!("tmsg_{}", uuid::Uuid::new_v4()),
        student_id,
        teacher_name: teacher.base().name.clone(),
        content,
        timestamp: now_ms(),
        read: false,
    };
    db::insert_teacher_message(&state.db, &message)
        .await
        .req(&req_id)?;
    info!(teacher_id = %user.id, student_id = %message.student_id, "teacher message sent");
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_my_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> Result<Json<Vec<TeacherMessage>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    user.require_student(&req_id)?;
    Ok(Json(db::list_messages_for(&state.db, &user.id).await.req(&req_id)?))
}
