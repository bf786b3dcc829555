use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Teacher => "TEACHER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STUDENT" => Ok(Role::Student),
            "TEACHER" => Ok(Role::Teacher),
            other => Err(format!("unknown role {other}")),
        }
    }
}

/// Fields every account carries regardless of role.
#[derive(Debug, Clone, Serialize)]
pub struct UserBase {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub bio: Option<String>,
    pub mastery_score: i64,
    pub topics_completed: i64,
    pub at_risk: bool,
    pub sentiment_trend: Vec<Sentiment>,
    pub preferred_language: Option<String>,
    pub preferred_voice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherProfile {
    pub subject: Option<String>,
    pub bio: Option<String>,
    pub years_of_experience: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum User {
    Student { base: UserBase, profile: StudentProfile },
    Teacher { base: UserBase, profile: TeacherProfile },
}

impl User {
    pub fn base(&self) -> &UserBase {
        match self {
            User::Student { base, .. } | User::Teacher { base, .. } => base,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            User::Student { .. } => Role::Student,
            User::Teacher { .. } => Role::Teacher,
        }
    }

    /// Role-tagged summary returned by the profile endpoint.
    pub fn summary(&self) -> Value {
        let base = self.base();
        let mut out = serde_json::json!({
            "id": base.id,
            "name": base.name,
            "email": base.email,
            "phone": base.phone,
            "role": self.role(),
        });
        let extra = match self {
            User::Student { profile, .. } => serde_json::to_value(profile),
            User::Teacher { profile, .. } => serde_json::to_value(profile),
        };
        if let (Some(map), Ok(Value::Object(fields))) = (out.as_object_mut(), extra) {
            map.extend(fields);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Frustrated,
}

impl Sentiment {
    pub fn is_distressed(&self) -> bool {
        matches!(self, Sentiment::Negative | Sentiment::Frustrated)
    }

    /// Lenient parse of whatever label the model produced.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Sentiment::Positive,
            "NEGATIVE" => Sentiment::Negative,
            "FRUSTRATED" => Sentiment::Frustrated,
            _ => Sentiment::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    None,
    ReviewTopic,
    FlagTeacher,
}

impl SuggestedAction {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "REVIEW_TOPIC" => SuggestedAction::ReviewTopic,
            "FLAG_TEACHER" => SuggestedAction::FlagTeacher,
            _ => SuggestedAction::None,
        }
    }
}

pub const SENTIMENT_TREND_LEN: usize = 10;
const AT_RISK_STREAK: usize = 3;

/// Appends a sentiment, keeps the most recent window and reports whether the
/// tail is a run of distressed turns.
pub fn push_sentiment(trend: &mut Vec<Sentiment>, sentiment: Sentiment) -> bool {
    trend.push(sentiment);
    if trend.len() > SENTIMENT_TREND_LEN {
        let excess = trend.len() - SENTIMENT_TREND_LEN;
        trend.drain(..excess);
    }
    trend.len() >= AT_RISK_STREAK
        && trend.iter().rev().take(AT_RISK_STREAK).all(|s| s.is_distressed())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    Locked,
    InProgress,
    Completed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Locked => "LOCKED",
            ModuleStatus::InProgress => "IN_PROGRESS",
            ModuleStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for ModuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCKED" => Ok(ModuleStatus::Locked),
            "IN_PROGRESS" => Ok(ModuleStatus::InProgress),
            "COMPLETED" => Ok(ModuleStatus::Completed),
            other => Err(format!("unknown module status {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStats {
    pub id: String,
    pub name: String,
    pub mastery: i64,
    pub time_spent: i64,
    pub status: ModuleStatus,
    #[serde(skip)]
    pub position: i64,
}

pub const COMPLETION_MASTERY: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterySummary {
    pub mastery_score: i64,
    pub topics_completed: i64,
}

/// Applies a score/time delta to `modules[index]` (ordered by position) and
/// returns the student's recomputed totals. Reaching completion unlocks the
/// next locked module.
pub fn apply_module_progress(
    modules: &mut [ModuleStats],
    index: usize,
    score_delta: i64,
    time_delta: i64,
) -> Option<MasterySummary> {
    let module = modules.get_mut(index)?;
    module.mastery = module.mastery.saturating_add(score_delta).clamp(0, 100);
    module.time_spent = module.time_spent.saturating_add(time_delta).max(0);

    if module.mastery >= COMPLETION_MASTERY {
        module.status = ModuleStatus::Completed;
        if let Some(next) = modules.get_mut(index + 1) {
            if next.status == ModuleStatus::Locked {
                next.status = ModuleStatus::InProgress;
            }
        }
    } else if module.mastery > 0 && module.status == ModuleStatus::Locked {
        module.status = ModuleStatus::InProgress;
    }

    Some(summarize_mastery(modules))
}

pub fn summarize_mastery(modules: &[ModuleStats]) -> MasterySummary {
    if modules.is_empty() {
        return MasterySummary { mastery_score: 0, topics_completed: 0 };
    }
    let total: i64 = modules.iter().map(|m| m.mastery).sum();
    MasterySummary {
        mastery_score: total.div_euclid(modules.len() as i64),
        topics_completed: modules
            .iter()
            .filter(|m| m.status == ModuleStatus::Completed)
            .count() as i64,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            other => Err(format!("unknown severity {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterventionFlag {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub reason: String,
    pub severity: Severity,
    pub timestamp: i64,
}

pub const AT_RISK_MASTERY: i64 = 60;
const CRITICAL_MASTERY: i64 = 50;

/// Flag computed from a student's standing, if it warrants one.
pub fn derive_intervention(
    student_id: &str,
    student_name: &str,
    mastery_score: i64,
    at_risk: bool,
    now_ms: i64,
) -> Option<InterventionFlag> {
    if !at_risk && mastery_score >= AT_RISK_MASTERY {
        return None;
    }
    let critical = mastery_score < CRITICAL_MASTERY;
    Some(InterventionFlag {
        id: format!("flag_{student_id}"),
        student_id: student_id.to_string(),
        student_name: student_name.to_string(),
        reason: if critical {
            "Critically Low Mastery".to_string()
        } else {
            "Negative Sentiment Trend".to_string()
        },
        severity: if critical { Severity::High } else { Severity::Medium },
        timestamp: now_ms,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    #[serde(default, deserialize_with = "lenient_opt_int")]
    pub id: Option<i64>,
    pub question: String,
    pub options: Vec<String>,
    #[serde(deserialize_with = "lenient_int")]
    pub correct_answer: i64,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub module_id: String,
}

/// Model-written quizzes use `1` and `"1"` interchangeably.
#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrText {
    Int(i64),
    Text(String),
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match IntOrText::deserialize(deserializer)? {
        IntOrText::Int(n) => Ok(n),
        IntOrText::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected an integer, got {s:?}"))),
    }
}

/// Ids that are not numbers are dropped and renumbered by the caller.
fn lenient_opt_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<IntOrText>::deserialize(deserializer)? {
        Some(IntOrText::Int(n)) => Some(n),
        Some(IntOrText::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

impl QuizQuestion {
    pub fn validate(&self) -> Result<(), String> {
        if self.question.trim().is_empty() {
            return Err("question must not be empty".into());
        }
        if self.options.len() < 2 {
            return Err("at least 2 options are required".into());
        }
        if self.correct_answer < 0 || self.correct_answer as usize >= self.options.len() {
            return Err("correctAnswer must reference an option".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: String,
    pub date: i64,
    pub module_id: String,
    pub score: i64,
    pub max_score: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudyResource {
    pub id: String,
    pub title: String,
    pub uri: String,
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub date_saved: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub mime_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConversation {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptItem {
    pub role: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    pub id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub transcript: Vec<TranscriptItem>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Visual {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub data: Value,
    pub created_at: i64,
    #[serde(rename = "student_id")]
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiDecisionLog {
    pub id: String,
    pub student_id: String,
    pub student_input: String,
    pub ai_output: String,
    pub reasoning: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeacherMessage {
    pub id: String,
    pub student_id: String,
    pub teacher_name: String,
    pub content: String,
    pub timestamp: i64,
    pub read: bool,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
