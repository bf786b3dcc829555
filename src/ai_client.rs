//! Outbound generative-model access.
//!
//! Handlers only see the [`GenerativeModel`] trait. [`GeminiClient`] talks to
//! the Gemini REST API and Cloud Text-to-Speech; [`MockAiClient`] answers
//! offline with canned payloads when no API key is configured.

use crate::config::Config;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("AI service is unreachable: {0}")]
    Transport(String),
    #[error("AI service returned status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("AI service quota exhausted")]
    QuotaExhausted,
    #[error("AI model returned an invalid response: {0}")]
    MalformedReply(String),
    #[error("AI model returned no content")]
    EmptyReply,
    #[error("AI service is not configured")]
    NotConfigured,
}

/// What a call is for; drives logging and the offline mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiTask {
    SocraticChat,
    ChatTitle,
    ResourceSearch,
    QuizGeneration,
    Transcription,
    CodeAnalysis,
    ExamTrends,
    TopicExpansion,
    TextVisualization,
    Mindmap,
    Infographic,
}

impl fmt::Display for AiTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AiTask::SocraticChat => "socratic_chat",
            AiTask::ChatTitle => "chat_title",
            AiTask::ResourceSearch => "resource_search",
            AiTask::QuizGeneration => "quiz_generation",
            AiTask::Transcription => "transcription",
            AiTask::CodeAnalysis => "code_analysis",
            AiTask::ExamTrends => "exam_trends",
            AiTask::TopicExpansion => "topic_expansion",
            AiTask::TextVisualization => "text_visualization",
            AiTask::Mindmap => "mindmap",
            AiTask::Infographic => "infographic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub text: String,
}

/// Binary payload sent inline next to the prompt, base64 encoded.
#[derive(Debug, Clone)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub task: AiTask,
    pub system_instruction: Option<String>,
    pub history: Vec<ChatTurn>,
    pub prompt: String,
    pub attachments: Vec<InlineData>,
    pub web_search: bool,
}

impl GenerateRequest {
    pub fn new(task: AiTask, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system_instruction: None,
            history: Vec::new(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            web_search: false,
        }
    }

    pub fn with_attachment(mut self, mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        self.attachments.push(InlineData {
            mime_type: mime_type.into(),
            data: data.into(),
        });
        self
    }
}

/// Web citation attached to a search-grounded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingChunk {
    pub uri: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateReply {
    pub text: String,
    pub grounding: Vec<GroundingChunk>,
}

#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub language_code: String,
    pub voice_name: Option<String>,
}

pub trait GenerativeModel: Send + Sync {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<GenerateReply, AiError>>;

    /// Returns MP3 bytes.
    fn synthesize_speech(&self, request: SpeechRequest) -> BoxFuture<'static, Result<Vec<u8>, AiError>>;
}

#[derive(Clone)]
pub struct MockAiClient;

impl MockAiClient {
    fn canned(request: &GenerateRequest) -> GenerateReply {
        let topic: String = request.prompt.chars().take(40).collect();
        let text = match request.task {
            AiTask::SocraticChat => json!({
                "tutor_response": "What do you already know about this? Try explaining the first step in your own words.",
                "pedagogical_reasoning": "Offline tutor: prompting recall before giving hints.",
                "detected_sentiment": "NEUTRAL",
                "suggested_action": "NONE"
            })
            .to_string(),
            AiTask::ChatTitle => json!({ "title": "Study Session" }).to_string(),
            AiTask::ResourceSearch => {
                "Offline mode: connect an AI key to search for study resources.".to_string()
            }
            AiTask::QuizGeneration => json!([
                {
                    "id": 1,
                    "question": "Which statement best summarises the topic?",
                    "options": ["Statement A", "Statement B", "Statement C", "Statement D"],
                    "correctAnswer": 0
                }
            ])
            .to_string(),
            AiTask::Transcription => "[offline transcription unavailable]".to_string(),
            AiTask::CodeAnalysis => json!({
                "fixedCode": "// offline mode: no analysis performed",
                "explanation": "The AI service is not configured."
            })
            .to_string(),
            AiTask::ExamTrends => json!({
                "questions": [{
                    "id": "q1",
                    "question": "Explain the core concept of the topic.",
                    "probability": "HIGH",
                    "yearsAppeared": [],
                    "marks": "5",
                    "tips": "Start with a definition, then give an example."
                }]
            })
            .to_string(),
            AiTask::TopicExpansion => json!({
                "nodes": [
                    {"id": "exp-1", "label": "Definition"},
                    {"id": "exp-2", "label": "Examples"}
                ]
            })
            .to_string(),
            AiTask::TextVisualization => json!({
                "steps": ["```mermaid\nflowchart TD\n  A[Input] --> B[Output]\n```"]
            })
            .to_string(),
            AiTask::Mindmap => json!({
                "title": "Mindmap",
                "nodes": [{"id": "root", "label": "Mindmap"}]
            })
            .to_string(),
            AiTask::Infographic => json!({
                "title": "Infographic",
                "highlight_insights": [],
                "sections": []
            })
            .to_string(),
        };
        debug!(task = %request.task, prompt_head = %topic, "mock AI reply");
        GenerateReply {
            text,
            grounding: Vec::new(),
        }
    }
}

impl GenerativeModel for MockAiClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<GenerateReply, AiError>> {
        let reply = Self::canned(&request);
        Box::pin(async move { Ok(reply) })
    }

    fn synthesize_speech(&self, _request: SpeechRequest) -> BoxFuture<'static, Result<Vec<u8>, AiError>> {
        Box::pin(async move { Err(AiError::NotConfigured) })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GeminiGroundingChunk>,
}

#[derive(Deserialize)]
struct GeminiGroundingChunk {
    #[serde(default)]
    web: Option<GeminiWeb>,
}

#[derive(Deserialize)]
struct GeminiWeb {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    ssml_gender: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    #[serde(default)]
    audio_content: String,
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    tts_base_url: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn from_config(config: &Config) -> Option<Self> {
        let api_key = config.gemini_api_key.clone()?;
        let http = match reqwest::Client::builder().timeout(config.ai_timeout).build() {
            Ok(c) => c,
            Err(err) => {
                warn!("failed to build AI http client: {}", err);
                return None;
            }
        };
        Some(Self {
            http,
            api_key,
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.clone(),
            tts_base_url: config.tts_base_url.clone(),
            timeout: config.ai_timeout,
        })
    }

    fn build_body(request: &GenerateRequest) -> GeminiRequest {
        let mut contents: Vec<GeminiContent> = request
            .history
            .iter()
            .map(|turn| GeminiContent {
                role: Some(
                    match turn.role {
                        TurnRole::User => "user",
                        TurnRole::Model => "model",
                    }
                    .to_string(),
                ),
                parts: vec![GeminiPart {
                    text: Some(turn.text.clone()),
                    inline_data: None,
                }],
            })
            .collect();

        let mut parts = vec![GeminiPart {
            text: Some(request.prompt.clone()),
            inline_data: None,
        }];
        parts.extend(request.attachments.iter().map(|a| GeminiPart {
            text: None,
            inline_data: Some(GeminiInlineData {
                mime_type: a.mime_type.clone(),
                data: a.data.clone(),
            }),
        }));
        contents.push(GeminiContent {
            role: Some("user".to_string()),
            parts,
        });

        GeminiRequest {
            system_instruction: request.system_instruction.as_ref().map(|s| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(s.clone()),
                    inline_data: None,
                }],
            }),
            contents,
            tools: if request.web_search {
                vec![json!({ "google_search": {} })]
            } else {
                Vec::new()
            },
        }
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> AiError {
        if err.is_timeout() {
            AiError::Timeout(timeout)
        } else {
            AiError::Transport(err.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AiError::QuotaExhausted);
        }
        let message: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(300)
            .collect();
        Err(AiError::Upstream {
            status: status.as_u16(),
            message,
        })
    }
}

impl GenerativeModel for GeminiClient {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<GenerateReply, AiError>> {
        let http = self.http.clone();
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let timeout = self.timeout;
        let body = Self::build_body(&request);
        let task = request.task;

        Box::pin(async move {
            let started = Instant::now();
            let response = http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| Self::classify(e, timeout))?;
            let response = Self::check_status(response).await?;
            let parsed: GeminiResponse = response
                .json()
                .await
                .map_err(|e| AiError::MalformedReply(e.to_string()))?;

            let Some(candidate) = parsed.candidates.into_iter().next() else {
                return Err(AiError::EmptyReply);
            };
            let text: String = candidate
                .content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("");
            let grounding = candidate
                .grounding_metadata
                .unwrap_or_default()
                .grounding_chunks
                .into_iter()
                .filter_map(|c| c.web)
                .map(|w| GroundingChunk {
                    uri: w.uri,
                    title: w.title,
                })
                .collect();

            info!(
                task = %task,
                model = %model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                chars = text.len(),
                "gemini call finished"
            );
            debug!(task = %task, "gemini raw reply: {}", text);
            Ok(GenerateReply { text, grounding })
        })
    }

    fn synthesize_speech(&self, request: SpeechRequest) -> BoxFuture<'static, Result<Vec<u8>, AiError>> {
        let http = self.http.clone();
        let url = format!("{}/text:synthesize", self.tts_base_url);
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let body = SynthesizeRequest {
                input: SynthesisInput { text: &request.text },
                voice: VoiceSelection {
                    language_code: &request.language_code,
                    name: request.voice_name.as_deref(),
                    ssml_gender: "NEUTRAL",
                },
                audio_config: AudioConfig { audio_encoding: "MP3" },
            };
            let response = http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| Self::classify(e, timeout))?;
            let response = Self::check_status(response).await?;
            let parsed: SynthesizeResponse = response
                .json()
                .await
                .map_err(|e| AiError::MalformedReply(e.to_string()))?;
            let audio = STANDARD
                .decode(parsed.audio_content.as_bytes())
                .map_err(|e| AiError::MalformedReply(e.to_string()))?;
            if audio.is_empty() {
                return Err(AiError::EmptyReply);
            }
            Ok(audio)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_orders_history_before_prompt() {
        let mut request = GenerateRequest::new(AiTask::SocraticChat, "what is 2+2?")
            .with_attachment("image/png", "aGVsbG8=");
        request.system_instruction = Some("be socratic".into());
        request.history = vec![
            ChatTurn { role: TurnRole::User, text: "hi".into() },
            ChatTurn { role: TurnRole::Model, text: "hello".into() },
        ];
        let body = serde_json::to_value(GeminiClient::build_body(&request)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be socratic");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "what is 2+2?");
        assert_eq!(body["contents"][2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn web_search_adds_tool() {
        let mut request = GenerateRequest::new(AiTask::ResourceSearch, "rust ownership");
        request.web_search = true;
        let body = serde_json::to_value(GeminiClient::build_body(&request)).unwrap();
        assert!(body["tools"][0].get("google_search").is_some());
    }

    #[test]
    fn grounding_metadata_is_parsed() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Summary"}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://example.edu/a.pdf", "title": "Notes"}},
                    {"retrievedContext": {}}
                ]}
            }]
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        let candidate = &parsed.candidates[0];
        let chunks = &candidate.grounding_metadata.as_ref().unwrap().grounding_chunks;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].web.is_none());
    }
}
