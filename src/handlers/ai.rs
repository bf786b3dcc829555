//! AI proxy endpoints. Each one builds a prompt, calls the model through
//! [`call_model`] and shapes the reply according to its own fallback policy.

use super::{call_model, call_speech, ensure_base64, request_id_from_headers, validate_payload, AppJson};
use crate::ai_client::{AiError, AiTask, ChatTurn, GenerateRequest, GroundingChunk, SpeechRequest, TurnRole};
use crate::auth::MaybeUser;
use crate::db::{self, StoreError};
use crate::error::{AppError, ErrorDetail, ResultExt};
use crate::models::{
    now_ms, push_sentiment, AiDecisionLog, Attachment, InterventionFlag, Role,
    Sentiment, Severity, SuggestedAction, User,
};
use crate::normalize::{normalize_reply, title_from_text, FallbackPolicy};
use crate::prompts;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{info, warn};
use validator::Validate;

const IMAGE_MIME: &str = "image/jpeg";
const NO_SUMMARY: &str = "No summary available.";

// ------------------------------------------------------------ tutoring

#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SocraticPayload {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[validate(required(message = "currentMessage is required"), length(min = 1))]
    pub current_message: Option<String>,
    pub language: Option<String>,
    pub attachment: Option<Attachment>,
}

fn history_turns(history: &[HistoryEntry]) -> Vec<ChatTurn> {
    history
        .iter()
        .filter(|h| !h.content.trim().is_empty())
        .map(|h| ChatTurn {
            role: match h.role.as_str() {
                "model" | "assistant" => TurnRole::Model,
                _ => TurnRole::User,
            },
            text: h.content.clone(),
        })
        .collect()
}

pub async fn socratic_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    AppJson(payload): AppJson<SocraticPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let Some(message) = payload.current_message else {
        return Err(AppError::validation("missing current message", req_id));
    };
    let language = payload.language.unwrap_or_else(|| "en".to_string());

    let mut request = GenerateRequest::new(AiTask::SocraticChat, message.clone());
    request.system_instruction = Some(prompts::socratic_system_instruction(&language));
    request.history = history_turns(&payload.history);
    if let Some(attachment) = payload.attachment {
        ensure_base64("attachment.data", &attachment.data, &req_id)?;
        request = request.with_attachment(attachment.mime_type, attachment.data);
    }

    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::TutorEnvelope).req(&req_id)?;

    if let Some(user) = user.filter(|u| u.role == Role::Student) {
        if let Err(err) = record_tutoring_turn(&state, &user.id, &message, &value).await {
            warn!(request_id = %req_id, student_id = %user.id, "failed to record tutoring turn: {}", err);
        }
    }
    Ok(Json(value))
}

/// Logs the exchange for teachers and folds the detected sentiment into the
/// student's standing.
async fn record_tutoring_turn(
    state: &AppState,
    student_id: &str,
    input: &str,
    reply: &Value,
) -> Result<(), StoreError> {
    let Some(User::Student { base, profile }) = db::find_student(&state.db, student_id).await? else {
        return Ok(());
    };
    let field = |name: &str| reply.get(name).and_then(Value::as_str).unwrap_or_default();
    let reasoning = match field("pedagogical_reasoning") {
        "" => "No reasoning provided.",
        r => r,
    };
    let sentiment = Sentiment::from_label(field("detected_sentiment"));
    let action = SuggestedAction::from_label(field("suggested_action"));
    let now = now_ms();

    db::insert_decision_log(
        &state.db,
        &AiDecisionLog {
            id: format!("log_{}", uuid::Uuid::new_v4()),
            student_id: student_id.to_string(),
            student_input: input.to_string(),
            ai_output: field("tutor_response").to_string(),
            reasoning: reasoning.to_string(),
            timestamp: now,
        },
    )
    .await?;

    let mut trend = profile.sentiment_trend;
    let streak = push_sentiment(&mut trend, sentiment);
    let at_risk = profile.at_risk || streak;
    if streak && !profile.at_risk {
        info!(student_id, "student marked at risk after a distressed streak");
    }
    db::update_standing(&state.db, student_id, &trend, at_risk).await?;

    if action == SuggestedAction::FlagTeacher {
        let reason: String = format!("AI tutor flagged: {reasoning}").chars().take(300).collect();
        db::insert_flag(
            &state.db,
            &InterventionFlag {
                id: format!("flag_{}", uuid::Uuid::new_v4()),
                student_id: student_id.to_string(),
                student_name: base.name,
                reason,
                severity: Severity::High,
                timestamp: now,
            },
        )
        .await?;
        info!(student_id, "tutor raised a teacher flag");
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct TitlePayload {
    #[validate(required(message = "message is required"), length(min = 1))]
    pub message: Option<String>,
}

fn extract_title(value: &Value) -> String {
    let raw = match value {
        Value::Object(map) => map.get("title").and_then(Value::as_str).unwrap_or_default(),
        Value::String(s) => s.as_str(),
        _ => "",
    };
    title_from_text(raw)
}

pub async fn generate_title(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<TitlePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let message = payload.message.unwrap_or_default();
    let request = GenerateRequest::new(AiTask::ChatTitle, prompts::chat_title_prompt(&message));
    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::TitleFromText).req(&req_id)?;
    Ok(Json(json!({ "title": extract_title(&value) })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SpeechPayload {
    #[validate(required(message = "text is required"), length(min = 1, max = 5000))]
    pub text: Option<String>,
    pub language_code: Option<String>,
    pub voice: Option<String>,
}

pub async fn text_to_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<SpeechPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let request = SpeechRequest {
        text: payload.text.unwrap_or_default(),
        language_code: payload.language_code.unwrap_or_else(|| "en-US".to_string()),
        voice_name: payload.voice,
    };
    let audio = call_speech(&state, request, &req_id).await?;
    Ok(Json(json!({ "audio_content": STANDARD.encode(audio) })))
}

// ------------------------------------------------------------ resources

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FoundResource {
    pub id: String,
    pub title: String,
    pub uri: String,
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

pub(crate) fn resource_kind(uri: &str) -> &'static str {
    if uri.to_ascii_lowercase().ends_with(".pdf") {
        "PDF"
    } else {
        "WEB"
    }
}

pub(crate) fn source_host(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// Citations with both a uri and a title, first occurrence of each uri kept.
pub(crate) fn resources_from_grounding(chunks: &[GroundingChunk]) -> Vec<FoundResource> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter_map(|c| match (&c.uri, &c.title) {
            (Some(uri), Some(title)) if !uri.is_empty() && !title.is_empty() => Some((uri, title)),
            _ => None,
        })
        .filter(|&(uri, _)| seen.insert(uri.as_str()))
        .map(|(uri, title)| FoundResource {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.clone(),
            uri: uri.clone(),
            source: source_host(uri),
            kind: resource_kind(uri),
        })
        .collect()
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchPayload {
    #[validate(required(message = "query is required"), length(min = 1, max = 500))]
    pub query: Option<String>,
}

pub async fn search_resources(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<SearchPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let query = payload.query.unwrap_or_default();
    let mut request = GenerateRequest::new(AiTask::ResourceSearch, prompts::resource_search_prompt(&query));
    request.web_search = true;

    let reply = call_model(&state, request, &req_id).await?;
    let summary = match reply.text.trim() {
        "" => NO_SUMMARY.to_string(),
        text => text.to_string(),
    };
    let resources = resources_from_grounding(&reply.grounding);
    info!(request_id = %req_id, found = resources.len(), "resource search finished");
    Ok(Json(json!({ "summary": summary, "resources": resources })))
}

// ---------------------------------------------------------------- quiz

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QuizPayload {
    #[validate(required(message = "topic is required"), length(min = 1, max = 300))]
    pub topic: Option<String>,
    pub difficulty: Option<String>,
    pub module_id: Option<String>,
}

/// Accepts a bare array or `{questions: [...]}` and stamps every question
/// with the requested topic and module. Questions otherwise pass through as
/// the model wrote them; only a missing id is filled in.
pub(crate) fn shape_quiz(value: Value, topic: &str, module_id: &str) -> Result<Vec<Value>, AiError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            _ => return Err(AiError::MalformedReply("quiz reply has no questions array".into())),
        },
        _ => return Err(AiError::MalformedReply("quiz reply is not a list".into())),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(mut question) => {
                if question.get("id").map_or(true, Value::is_null) {
                    question.insert("id".to_string(), json!(i + 1));
                }
                question.insert("topic".to_string(), Value::String(topic.to_string()));
                question.insert("moduleId".to_string(), Value::String(module_id.to_string()));
                Ok(Value::Object(question))
            }
            _ => Err(AiError::MalformedReply(format!("question {} is not an object", i + 1))),
        })
        .collect()
}

pub async fn generate_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<QuizPayload>,
) -> Result<Json<Vec<Value>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let topic = payload.topic.unwrap_or_default();
    let difficulty = payload
        .difficulty
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "Medium".to_string());
    let module_id = payload.module_id.unwrap_or_default();

    let request = GenerateRequest::new(
        AiTask::QuizGeneration,
        prompts::quiz_prompt(&topic, &difficulty, &module_id),
    );
    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?;
    Ok(Json(shape_quiz(value, &topic, &module_id).req(&req_id)?))
}

// ------------------------------------------------------- media analysis

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TranscribePayload {
    #[validate(required(message = "audioBase64 is required"), length(min = 1))]
    pub audio_base64: Option<String>,
    #[validate(required(message = "mimeType is required"), length(min = 1, max = 100))]
    pub mime_type: Option<String>,
}

pub async fn transcribe_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<TranscribePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let (Some(audio), Some(mime_type)) = (payload.audio_base64, payload.mime_type) else {
        return Err(AppError::validation("missing audio data or mime type", req_id));
    };
    ensure_base64("audioBase64", &audio, &req_id)?;

    let request = GenerateRequest::new(AiTask::Transcription, prompts::TRANSCRIPTION_PROMPT)
        .with_attachment(mime_type, audio);
    let reply = call_model(&state, request, &req_id).await?;
    Ok(Json(json!({ "text": reply.text.trim() })))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CodeImagePayload {
    #[validate(required(message = "imageBase64 is required"), length(min = 1))]
    pub image_base64: Option<String>,
    pub language: Option<String>,
}

pub async fn analyze_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<CodeImagePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let image = payload.image_base64.unwrap_or_default();
    ensure_base64("imageBase64", &image, &req_id)?;
    let language = payload
        .language
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "plaintext".to_string());

    let request = GenerateRequest::new(AiTask::CodeAnalysis, prompts::code_analysis_prompt(&language))
        .with_attachment(IMAGE_MIME, image);
    let reply = call_model(&state, request, &req_id).await?;
    Ok(Json(normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct TopicPayload {
    #[validate(required(message = "topic is required"), length(min = 1, max = 300))]
    pub topic: Option<String>,
}

/// Pulls the predicted questions out and numbers them `pred_1..n`.
pub(crate) fn shape_exam_trends(value: Value) -> Result<Vec<Value>, AiError> {
    let items = match value {
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            _ => return Err(AiError::MalformedReply("exam trends reply has no questions array".into())),
        },
        Value::Array(items) => items,
        _ => return Err(AiError::MalformedReply("exam trends reply is not an object".into())),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(mut q) => {
                q.insert("id".to_string(), Value::String(format!("pred_{}", i + 1)));
                Ok(Value::Object(q))
            }
            _ => Err(AiError::MalformedReply(format!("question {} is not an object", i + 1))),
        })
        .collect()
}

pub async fn analyze_exam_trends(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<TopicPayload>,
) -> Result<Json<Vec<Value>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let topic = payload.topic.unwrap_or_default();
    let request = GenerateRequest::new(AiTask::ExamTrends, prompts::exam_trends_prompt(&topic));
    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?;
    Ok(Json(shape_exam_trends(value).req(&req_id)?))
}

// ------------------------------------------------------------- visuals

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExpandPayload {
    #[validate(required(message = "topic is required"), length(min = 1, max = 300))]
    pub topic: Option<String>,
    pub context: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedNode {
    pub id: String,
    pub label: String,
    pub parent_id: Option<String>,
}

/// Keeps nodes that carry a label; nodes without a parent hang off `parent_id`.
pub(crate) fn shape_expansion(value: Value, parent_id: Option<&str>) -> Result<Vec<ExpandedNode>, AiError> {
    let items = match value {
        Value::Object(mut map) => match map.remove("nodes") {
            Some(Value::Array(items)) => items,
            _ => return Err(AiError::MalformedReply("expansion reply has no nodes array".into())),
        },
        Value::Array(items) => items,
        _ => return Err(AiError::MalformedReply("expansion reply is not an object".into())),
    };
    let prefix = parent_id.unwrap_or("node");
    Ok(items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let label = item.get("label").and_then(Value::as_str)?.trim();
            if label.is_empty() {
                return None;
            }
            let text = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
            Some(ExpandedNode {
                id: text("id").unwrap_or_else(|| format!("{prefix}-{}", i + 1)),
                label: label.to_string(),
                parent_id: text("parentId").or_else(|| parent_id.map(str::to_string)),
            })
        })
        .collect())
}

pub async fn expand_topic(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<ExpandPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let topic = payload.topic.unwrap_or_default();
    let request = GenerateRequest::new(
        AiTask::TopicExpansion,
        prompts::expand_topic_prompt(&topic, payload.context.as_deref()),
    );
    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?;
    let nodes = shape_expansion(value, payload.parent_id.as_deref()).req(&req_id)?;
    Ok(Json(json!({ "nodes": nodes })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct VisualizePayload {
    #[validate(required(message = "text is required"), length(min = 1, max = 20000))]
    pub text: Option<String>,
}

pub(crate) fn shape_steps(value: Value) -> Result<Vec<String>, AiError> {
    let items = match value {
        Value::Object(mut map) => match map.remove("steps") {
            Some(Value::Array(items)) => items,
            _ => return Err(AiError::MalformedReply("visualization reply has no steps array".into())),
        },
        Value::Array(items) => items,
        _ => return Err(AiError::MalformedReply("visualization reply is not an object".into())),
    };
    Ok(items
        .into_iter()
        .filter_map(|step| match step {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect())
}

pub async fn visualize_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<VisualizePayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    validate_payload(&payload, &req_id)?;
    let text = payload.text.unwrap_or_default();
    let request = GenerateRequest::new(AiTask::TextVisualization, prompts::visualize_text_prompt(&text));
    let reply = call_model(&state, request, &req_id).await?;
    let value = normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?;
    Ok(Json(json!({ "steps": shape_steps(value).req(&req_id)? })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    #[serde(default)]
    pub prompt: String,
    pub image_base64: Option<String>,
}

fn content_request(
    task: AiTask,
    payload: ContentPayload,
    build: fn(&str) -> String,
    request_id: &str,
) -> Result<GenerateRequest, AppError> {
    let image = payload.image_base64.filter(|i| !i.trim().is_empty());
    if payload.prompt.trim().is_empty() && image.is_none() {
        return Err(AppError::validation("no content provided", request_id).with_details(vec![ErrorDetail {
            field: "prompt".to_string(),
            issue: "prompt or imageBase64 is required".to_string(),
        }]));
    }
    let mut request = GenerateRequest::new(task, build(&payload.prompt));
    if let Some(image) = image {
        ensure_base64("imageBase64", &image, request_id)?;
        request = request.with_attachment(IMAGE_MIME, image);
    }
    Ok(request)
}

pub async fn generate_mindmap(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<ContentPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let request = content_request(AiTask::Mindmap, payload, prompts::mindmap_prompt, &req_id)?;
    let reply = call_model(&state, request, &req_id).await?;
    Ok(Json(normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?))
}

pub async fn generate_infographic(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(payload): AppJson<ContentPayload>,
) -> Result<Json<Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let request = content_request(AiTask::Infographic, payload, prompts::infographic_prompt, &req_id)?;
    let reply = call_model(&state, request, &req_id).await?;
    Ok(Json(normalize_reply(&reply.text, FallbackPolicy::Reject).req(&req_id)?))
}
