//! SQLite persistence. Every query that touches student-owned data is scoped
//! by the owning student's id, so a foreign id reads as "not found".

use crate::models::{
    summarize_mastery, AiDecisionLog, Attachment, ChatConversation, ChatMessage, InterventionFlag,
    LiveSession, MasterySummary, ModuleStats, ModuleStatus, QuizAttempt, QuizQuestion, Role,
    Sentiment, Severity, StudentProfile, StudyResource, TeacherMessage, TeacherProfile,
    TranscriptItem, User, UserBase, Visual,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(message.to_string()),
        _ => StoreError::Database(err),
    }
}

pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool_options = if url.contains(":memory:") {
        // Each connection would get its own empty in-memory database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;
    info!("database ready at {}", url);
    Ok(pool)
}

// ---------------------------------------------------------------- users

const USER_SELECT: &str = r#"
SELECT u.id, u.email, u.password, u.name, u.phone, u.role,
       s.bio AS student_bio, s.mastery_score, s.topics_completed, s.at_risk,
       s.sentiment_trend, s.preferred_language, s.preferred_voice,
       t.subject, t.bio AS teacher_bio, t.years_of_experience
FROM users u
LEFT JOIN students s ON s.id = u.id
LEFT JOIN teachers t ON t.id = u.id
"#;

#[derive(FromRow)]
struct UserRow {
    id: String,
    email: String,
    password: String,
    name: String,
    phone: Option<String>,
    role: String,
    student_bio: Option<String>,
    mastery_score: Option<i64>,
    topics_completed: Option<i64>,
    at_risk: Option<bool>,
    sentiment_trend: Option<Json<Vec<Sentiment>>>,
    preferred_language: Option<String>,
    preferred_voice: Option<String>,
    subject: Option<String>,
    teacher_bio: Option<String>,
    years_of_experience: Option<i64>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = Role::from_str(&row.role).map_err(StoreError::Corrupt)?;
        let base = UserBase {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            password_hash: row.password,
        };
        Ok(match role {
            Role::Student => User::Student {
                base,
                profile: StudentProfile {
                    bio: row.student_bio,
                    mastery_score: row.mastery_score.unwrap_or(0),
                    topics_completed: row.topics_completed.unwrap_or(0),
                    at_risk: row.at_risk.unwrap_or(false),
                    sentiment_trend: row.sentiment_trend.map(|t| t.0).unwrap_or_default(),
                    preferred_language: row.preferred_language,
                    preferred_voice: row.preferred_voice,
                },
            },
            Role::Teacher => User::Teacher {
                base,
                profile: TeacherProfile {
                    subject: row.subject,
                    bio: row.teacher_bio,
                    years_of_experience: row.years_of_experience,
                },
            },
        })
    }
}

async fn insert_user_base(
    tx: &mut sqlx::SqliteConnection,
    base: &UserBase,
    role: Role,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO users (id, email, password, name, phone, role) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(&base.id)
        .bind(&base.email)
        .bind(&base.password_hash)
        .bind(&base.name)
        .bind(&base.phone)
        .bind(role.as_str())
        .execute(tx)
        .await
        .map_err(|e| conflict_on_unique(e, "email already registered"))?;
    Ok(())
}

pub async fn insert_student(pool: &SqlitePool, base: &UserBase) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    insert_user_base(&mut tx, base, Role::Student).await?;
    sqlx::query("INSERT INTO students (id) VALUES (?)")
        .bind(&base.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn insert_teacher(
    pool: &SqlitePool,
    base: &UserBase,
    subject: Option<&str>,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    insert_user_base(&mut tx, base, Role::Teacher).await?;
    sqlx::query("INSERT INTO teachers (id, subject) VALUES (?, ?)")
        .bind(&base.id)
        .bind(subject)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn find_user(pool: &SqlitePool, id: &str) -> Result<Option<User>, StoreError> {
    let row: Option<UserRow> = sqlx::query_as(&format!("{USER_SELECT} WHERE u.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(User::try_from).transpose()
}

pub async fn find_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>, StoreError> {
    let row: Option<UserRow> = sqlx::query_as(&format!("{USER_SELECT} WHERE u.email = ?"))
        .bind(email)
        .fetch_optional(pool)
        .await?;
    row.map(User::try_from).transpose()
}

/// Fields a user may change on their own profile. `None` keeps the stored value.
#[derive(Debug, Default, Clone)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub bio: Option<String>,
    pub preferred_language: Option<String>,
    pub preferred_voice: Option<String>,
    pub subject: Option<String>,
    pub years_of_experience: Option<i64>,
}

pub async fn update_profile(
    pool: &SqlitePool,
    id: &str,
    role: Role,
    update: &ProfileUpdate,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    let done = sqlx::query("UPDATE users SET name = COALESCE(?, name), phone = COALESCE(?, phone) WHERE id = ?")
        .bind(&update.name)
        .bind(&update.phone)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StoreError::NotFound("user"));
    }
    match role {
        Role::Student => {
            sqlx::query(
                "UPDATE students SET bio = COALESCE(?, bio), preferred_language = COALESCE(?, preferred_language), \
                 preferred_voice = COALESCE(?, preferred_voice) WHERE id = ?",
            )
            .bind(&update.bio)
            .bind(&update.preferred_language)
            .bind(&update.preferred_voice)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        Role::Teacher => {
            sqlx::query(
                "UPDATE teachers SET bio = COALESCE(?, bio), subject = COALESCE(?, subject), \
                 years_of_experience = COALESCE(?, years_of_experience) WHERE id = ?",
            )
            .bind(&update.bio)
            .bind(&update.subject)
            .bind(update.years_of_experience)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

// ------------------------------------------------------------- students

pub async fn list_students(pool: &SqlitePool) -> Result<Vec<User>, StoreError> {
    let rows: Vec<UserRow> = sqlx::query_as(&format!("{USER_SELECT} WHERE u.role = 'STUDENT' ORDER BY u.name, u.id"))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(User::try_from).collect()
}

pub async fn find_student(pool: &SqlitePool, id: &str) -> Result<Option<User>, StoreError> {
    Ok(find_user(pool, id)
        .await?
        .filter(|u| matches!(u, User::Student { .. })))
}

pub async fn student_exists(pool: &SqlitePool, id: &str) -> Result<bool, StoreError> {
    let found: Option<(String,)> = sqlx::query_as("SELECT id FROM students WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn update_standing(
    pool: &SqlitePool,
    id: &str,
    trend: &[Sentiment],
    at_risk: bool,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE students SET sentiment_trend = ?, at_risk = ? WHERE id = ?")
        .bind(Json(trend))
        .bind(at_risk)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// -------------------------------------------------------------- modules

#[derive(FromRow)]
struct ModuleRow {
    id: String,
    name: String,
    mastery: i64,
    time_spent: i64,
    status: String,
    position: i64,
}

impl TryFrom<ModuleRow> for ModuleStats {
    type Error = StoreError;

    fn try_from(row: ModuleRow) -> Result<Self, Self::Error> {
        Ok(ModuleStats {
            status: ModuleStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            id: row.id,
            name: row.name,
            mastery: row.mastery,
            time_spent: row.time_spent,
            position: row.position,
        })
    }
}

async fn load_modules(
    conn: &mut sqlx::SqliteConnection,
    student_id: &str,
) -> Result<Vec<ModuleStats>, StoreError> {
    let rows: Vec<ModuleRow> = sqlx::query_as(
        "SELECT id, name, mastery, time_spent, status, position FROM module_stats \
         WHERE student_id = ? ORDER BY position, rowid",
    )
    .bind(student_id)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(ModuleStats::try_from).collect()
}

pub async fn list_modules(pool: &SqlitePool, student_id: &str) -> Result<Vec<ModuleStats>, StoreError> {
    let mut conn = pool.acquire().await?;
    load_modules(&mut conn, student_id).await
}

/// Stores an AI-generated module ahead of every existing one, together with
/// its questions.
pub async fn insert_module_with_questions(
    pool: &SqlitePool,
    student_id: &str,
    name: &str,
    questions: &[QuizQuestion],
) -> Result<ModuleStats, StoreError> {
    let mut tx = pool.begin().await?;
    let (min_position,): (Option<i64>,) =
        sqlx::query_as("SELECT MIN(position) FROM module_stats WHERE student_id = ?")
            .bind(student_id)
            .fetch_one(&mut *tx)
            .await?;
    let module = ModuleStats {
        id: format!("mod_{}", uuid::Uuid::new_v4()),
        name: name.to_string(),
        mastery: 0,
        time_spent: 0,
        status: ModuleStatus::InProgress,
        position: min_position.map(|p| p - 1).unwrap_or(0),
    };
    sqlx::query(
        "INSERT INTO module_stats (id, student_id, name, mastery, time_spent, status, position) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&module.id)
    .bind(student_id)
    .bind(&module.name)
    .bind(module.mastery)
    .bind(module.time_spent)
    .bind(module.status.as_str())
    .bind(module.position)
    .execute(&mut *tx)
    .await?;

    for q in questions {
        sqlx::query(
            "INSERT INTO quiz_questions (module_id, question, options, correct_answer, topic) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&module.id)
        .bind(&q.question)
        .bind(Json(&q.options))
        .bind(q.correct_answer)
        .bind(if q.topic.is_empty() { name } else { q.topic.as_str() })
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(module)
}

async fn owns_module(
    conn: &mut sqlx::SqliteConnection,
    student_id: &str,
    module_id: &str,
) -> Result<bool, StoreError> {
    let found: Option<(String,)> =
        sqlx::query_as("SELECT id FROM module_stats WHERE id = ? AND student_id = ?")
            .bind(module_id)
            .bind(student_id)
            .fetch_optional(conn)
            .await?;
    Ok(found.is_some())
}

#[derive(FromRow)]
struct QuestionRow {
    id: i64,
    module_id: String,
    question: String,
    options: Json<Vec<String>>,
    correct_answer: i64,
    topic: String,
}

pub async fn module_questions(
    pool: &SqlitePool,
    student_id: &str,
    module_id: &str,
) -> Result<Vec<QuizQuestion>, StoreError> {
    let mut conn = pool.acquire().await?;
    if !owns_module(&mut conn, student_id, module_id).await? {
        return Err(StoreError::NotFound("module"));
    }
    let rows: Vec<QuestionRow> = sqlx::query_as(
        "SELECT id, module_id, question, options, correct_answer, topic FROM quiz_questions \
         WHERE module_id = ? ORDER BY id",
    )
    .bind(module_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| QuizQuestion {
            id: Some(r.id),
            question: r.question,
            options: r.options.0,
            correct_answer: r.correct_answer,
            topic: r.topic,
            module_id: r.module_id,
        })
        .collect())
}

/// Applies a progress delta and persists every module whose state moved,
/// plus the student's recomputed totals.
pub async fn apply_progress(
    pool: &SqlitePool,
    student_id: &str,
    module_id: &str,
    score_delta: i64,
    time_delta: i64,
) -> Result<(Vec<ModuleStats>, MasterySummary), StoreError> {
    let mut tx = pool.begin().await?;
    let before = load_modules(&mut tx, student_id).await?;
    let index = before
        .iter()
        .position(|m| m.id == module_id)
        .ok_or(StoreError::NotFound("module"))?;

    let mut after = before.clone();
    let summary = crate::models::apply_module_progress(&mut after, index, score_delta, time_delta)
        .unwrap_or_else(|| summarize_mastery(&after));

    for (old, new) in before.iter().zip(after.iter()) {
        if old == new {
            continue;
        }
        sqlx::query("UPDATE module_stats SET mastery = ?, time_spent = ?, status = ? WHERE id = ?")
            .bind(new.mastery)
            .bind(new.time_spent)
            .bind(new.status.as_str())
            .bind(&new.id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE students SET mastery_score = ?, topics_completed = ? WHERE id = ?")
        .bind(summary.mastery_score)
        .bind(summary.topics_completed)
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok((after, summary))
}

// -------------------------------------------------------- quiz attempts

#[derive(FromRow)]
struct AttemptRow {
    id: String,
    date: i64,
    module_id: String,
    score: i64,
    max_score: i64,
}

pub async fn insert_attempt(
    pool: &SqlitePool,
    student_id: &str,
    attempt: &QuizAttempt,
) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await?;
    if !owns_module(&mut conn, student_id, &attempt.module_id).await? {
        return Err(StoreError::NotFound("module"));
    }
    sqlx::query(
        "INSERT INTO quiz_attempts (id, student_id, module_id, date, score, max_score) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&attempt.id)
    .bind(student_id)
    .bind(&attempt.module_id)
    .bind(attempt.date)
    .bind(attempt.score)
    .bind(attempt.max_score)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_attempts(pool: &SqlitePool, student_id: &str) -> Result<Vec<QuizAttempt>, StoreError> {
    let rows: Vec<AttemptRow> = sqlx::query_as(
        "SELECT id, date, module_id, score, max_score FROM quiz_attempts WHERE student_id = ? \
         ORDER BY date DESC, rowid DESC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| QuizAttempt {
            id: r.id,
            date: r.date,
            module_id: r.module_id,
            score: r.score,
            max_score: r.max_score,
        })
        .collect())
}

// ------------------------------------------------------------ resources

#[derive(FromRow)]
struct ResourceRow {
    id: String,
    title: String,
    uri: String,
    source: Option<String>,
    #[sqlx(rename = "type")]
    kind: Option<String>,
    date_saved: i64,
}

impl From<ResourceRow> for StudyResource {
    fn from(r: ResourceRow) -> Self {
        StudyResource {
            id: r.id,
            title: r.title,
            uri: r.uri,
            source: r.source,
            kind: r.kind,
            date_saved: Some(r.date_saved),
        }
    }
}

const RESOURCE_COLUMNS: &str = "id, title, uri, source, type, date_saved";

/// Saves a resource once per `(student, uri)`. The boolean is false when the
/// uri was already saved, in which case the stored record is returned.
pub async fn save_resource(
    pool: &SqlitePool,
    student_id: &str,
    resource: &StudyResource,
) -> Result<(StudyResource, bool), StoreError> {
    let date_saved = resource.date_saved.unwrap_or_else(crate::models::now_ms);
    let done = sqlx::query(
        "INSERT INTO study_resources (id, student_id, title, uri, source, type, date_saved) \
         VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (student_id, uri) DO NOTHING",
    )
    .bind(&resource.id)
    .bind(student_id)
    .bind(&resource.title)
    .bind(&resource.uri)
    .bind(&resource.source)
    .bind(&resource.kind)
    .bind(date_saved)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "resource id already exists"))?;

    let row: ResourceRow = sqlx::query_as(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM study_resources WHERE student_id = ? AND uri = ?"
    ))
    .bind(student_id)
    .bind(&resource.uri)
    .fetch_one(pool)
    .await?;
    Ok((row.into(), done.rows_affected() == 1))
}

pub async fn list_resources(pool: &SqlitePool, student_id: &str) -> Result<Vec<StudyResource>, StoreError> {
    let rows: Vec<ResourceRow> = sqlx::query_as(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM study_resources WHERE student_id = ? ORDER BY date_saved DESC, rowid DESC"
    ))
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(StudyResource::from).collect())
}

pub async fn delete_resource(pool: &SqlitePool, student_id: &str, id: &str) -> Result<(), StoreError> {
    let done = sqlx::query("DELETE FROM study_resources WHERE id = ? AND student_id = ?")
        .bind(id)
        .bind(student_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StoreError::NotFound("resource"));
    }
    Ok(())
}

// -------------------------------------------------------------- visuals

#[derive(FromRow)]
struct VisualRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: String,
    title: String,
    data: Json<Value>,
    created_at: i64,
    student_id: String,
}

pub async fn insert_visual(pool: &SqlitePool, visual: &Visual) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO visuals (id, student_id, type, title, data, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&visual.id)
    .bind(&visual.student_id)
    .bind(&visual.kind)
    .bind(&visual.title)
    .bind(Json(&visual.data))
    .bind(visual.created_at)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "visual id already saved"))?;
    Ok(())
}

pub async fn list_visuals(pool: &SqlitePool, student_id: &str) -> Result<Vec<Visual>, StoreError> {
    let rows: Vec<VisualRow> = sqlx::query_as(
        "SELECT id, type, title, data, created_at, student_id FROM visuals WHERE student_id = ? \
         ORDER BY created_at DESC, rowid DESC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| Visual {
            id: r.id,
            kind: r.kind,
            title: r.title,
            data: r.data.0,
            created_at: r.created_at,
            student_id: r.student_id,
        })
        .collect())
}

pub async fn delete_visual(pool: &SqlitePool, student_id: &str, id: &str) -> Result<(), StoreError> {
    let done = sqlx::query("DELETE FROM visuals WHERE id = ? AND student_id = ?")
        .bind(id)
        .bind(student_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StoreError::NotFound("visual"));
    }
    Ok(())
}

// -------------------------------------------------------- conversations

#[derive(FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    summary: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<ConversationRow> for ChatConversation {
    fn from(r: ConversationRow) -> Self {
        ChatConversation {
            id: r.id,
            title: r.title,
            summary: r.summary,
            created_at: r.created_at,
            updated_at: r.updated_at,
            messages: None,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    timestamp: i64,
    attachment: Option<Json<Attachment>>,
}

pub async fn insert_conversation(
    pool: &SqlitePool,
    student_id: &str,
    conversation: &ChatConversation,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO chat_conversations (id, student_id, title, summary, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&conversation.id)
    .bind(student_id)
    .bind(&conversation.title)
    .bind(&conversation.summary)
    .bind(conversation.created_at)
    .bind(conversation.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_conversations(
    pool: &SqlitePool,
    student_id: &str,
) -> Result<Vec<ChatConversation>, StoreError> {
    let rows: Vec<ConversationRow> = sqlx::query_as(
        "SELECT id, title, summary, created_at, updated_at FROM chat_conversations \
         WHERE student_id = ? ORDER BY updated_at DESC, rowid DESC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ChatConversation::from).collect())
}

pub async fn find_conversation(
    pool: &SqlitePool,
    student_id: &str,
    id: &str,
) -> Result<ChatConversation, StoreError> {
    let row: ConversationRow = sqlx::query_as(
        "SELECT id, title, summary, created_at, updated_at FROM chat_conversations \
         WHERE id = ? AND student_id = ?",
    )
    .bind(id)
    .bind(student_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("conversation"))?;

    let messages: Vec<MessageRow> = sqlx::query_as(
        "SELECT id, role, content, timestamp, attachment FROM messages \
         WHERE conversation_id = ? ORDER BY timestamp, rowid",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let mut conversation = ChatConversation::from(row);
    conversation.messages = Some(
        messages
            .into_iter()
            .map(|m| ChatMessage {
                id: m.id,
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
                attachment: m.attachment.map(|a| a.0),
            })
            .collect(),
    );
    Ok(conversation)
}

pub async fn append_message(
    pool: &SqlitePool,
    student_id: &str,
    conversation_id: &str,
    message: &ChatMessage,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    let touched = sqlx::query(
        "UPDATE chat_conversations SET updated_at = MAX(updated_at, ?) WHERE id = ? AND student_id = ?",
    )
    .bind(message.timestamp)
    .bind(conversation_id)
    .bind(student_id)
    .execute(&mut *tx)
    .await?;
    if touched.rows_affected() == 0 {
        return Err(StoreError::NotFound("conversation"));
    }
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, timestamp, attachment) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(conversation_id)
    .bind(&message.role)
    .bind(&message.content)
    .bind(message.timestamp)
    .bind(message.attachment.as_ref().map(Json))
    .execute(&mut *tx)
    .await
    .map_err(|e| conflict_on_unique(e, "message id already exists"))?;
    tx.commit().await?;
    Ok(())
}

pub async fn rename_conversation(
    pool: &SqlitePool,
    student_id: &str,
    id: &str,
    title: &str,
) -> Result<(), StoreError> {
    let done = sqlx::query("UPDATE chat_conversations SET title = ? WHERE id = ? AND student_id = ?")
        .bind(title)
        .bind(id)
        .bind(student_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StoreError::NotFound("conversation"));
    }
    Ok(())
}

// --------------------------------------------------------- live sessions

#[derive(FromRow)]
struct LiveSessionRow {
    id: String,
    start_time: i64,
    end_time: i64,
}

#[derive(FromRow)]
struct TranscriptRow {
    role: String,
    text: String,
    timestamp: i64,
}

pub async fn insert_live_session(
    pool: &SqlitePool,
    student_id: &str,
    session: &LiveSession,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO live_sessions (id, student_id, start_time, end_time) VALUES (?, ?, ?, ?)")
        .bind(&session.id)
        .bind(student_id)
        .bind(session.start_time)
        .bind(session.end_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "live session id already exists"))?;
    for item in &session.transcript {
        sqlx::query("INSERT INTO transcript_items (live_session_id, role, text, timestamp) VALUES (?, ?, ?, ?)")
            .bind(&session.id)
            .bind(&item.role)
            .bind(&item.text)
            .bind(item.timestamp)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_live_sessions(pool: &SqlitePool, student_id: &str) -> Result<Vec<LiveSession>, StoreError> {
    let rows: Vec<LiveSessionRow> = sqlx::query_as(
        "SELECT id, start_time, end_time FROM live_sessions WHERE student_id = ? ORDER BY start_time DESC, rowid DESC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    let mut sessions = Vec::with_capacity(rows.len());
    for row in rows {
        let items: Vec<TranscriptRow> = sqlx::query_as(
            "SELECT role, text, timestamp FROM transcript_items WHERE live_session_id = ? ORDER BY timestamp, id",
        )
        .bind(&row.id)
        .fetch_all(pool)
        .await?;
        sessions.push(LiveSession {
            id: row.id,
            start_time: row.start_time,
            end_time: row.end_time,
            transcript: items
                .into_iter()
                .map(|i| TranscriptItem {
                    role: i.role,
                    text: i.text,
                    timestamp: i.timestamp,
                })
                .collect(),
        });
    }
    Ok(sessions)
}

// -------------------------------------------------------------- teacher

#[derive(FromRow)]
struct FlagRow {
    id: String,
    student_id: String,
    student_name: String,
    reason: String,
    severity: String,
    timestamp: i64,
}

pub async fn insert_flag(pool: &SqlitePool, flag: &InterventionFlag) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO intervention_flags (id, student_id, student_name, reason, severity, timestamp) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&flag.id)
    .bind(&flag.student_id)
    .bind(&flag.student_name)
    .bind(&flag.reason)
    .bind(flag.severity.as_str())
    .bind(flag.timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_flags(pool: &SqlitePool) -> Result<Vec<InterventionFlag>, StoreError> {
    let rows: Vec<FlagRow> = sqlx::query_as(
        "SELECT id, student_id, student_name, reason, severity, timestamp FROM intervention_flags \
         ORDER BY timestamp DESC, rowid DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|r| {
            Ok(InterventionFlag {
                severity: Severity::from_str(&r.severity).map_err(StoreError::Corrupt)?,
                id: r.id,
                student_id: r.student_id,
                student_name: r.student_name,
                reason: r.reason,
                timestamp: r.timestamp,
            })
        })
        .collect()
}

#[derive(FromRow)]
struct LogRow {
    id: String,
    student_id: String,
    student_input: String,
    ai_output: String,
    reasoning: String,
    timestamp: i64,
}

pub async fn insert_decision_log(pool: &SqlitePool, log: &AiDecisionLog) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO ai_decision_logs (id, student_id, student_input, ai_output, reasoning, timestamp) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&log.id)
    .bind(&log.student_id)
    .bind(&log.student_input)
    .bind(&log.ai_output)
    .bind(&log.reasoning)
    .bind(log.timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_decision_logs(pool: &SqlitePool) -> Result<Vec<AiDecisionLog>, StoreError> {
    let rows: Vec<LogRow> = sqlx::query_as(
        "SELECT id, student_id, student_input, ai_output, reasoning, timestamp FROM ai_decision_logs \
         ORDER BY timestamp DESC, rowid DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| AiDecisionLog {
            id: r.id,
            student_id: r.student_id,
            student_input: r.student_input,
            ai_output: r.ai_output,
            reasoning: r.reasoning,
            timestamp: r.timestamp,
        })
        .collect())
}

#[derive(FromRow)]
struct TeacherMessageRow {
    id: String,
    student_id: String,
    teacher_name: String,
    content: String,
    timestamp: i64,
    read: bool,
}

pub async fn insert_teacher_message(pool: &SqlitePool, message: &TeacherMessage) -> Result<(), StoreError> {
    if !student_exists(pool, &message.student_id).await? {
        return Err(StoreError::NotFound("student"));
    }
    sqlx::query(
        "INSERT INTO teacher_messages (id, student_id, teacher_name, content, timestamp, read) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.student_id)
    .bind(&message.teacher_name)
    .bind(&message.content)
    .bind(message.timestamp)
    .bind(message.read)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_messages_for(pool: &SqlitePool, student_id: &str) -> Result<Vec<TeacherMessage>, StoreError> {
    let rows: Vec<TeacherMessageRow> = sqlx::query_as(
        "SELECT id, student_id, teacher_name, content, timestamp, read FROM teacher_messages \
         WHERE student_id = ? ORDER BY timestamp DESC, rowid DESC",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| TeacherMessage {
            id: r.id,
            student_id: r.student_id,
            teacher_name: r.teacher_name,
            content: r.content,
            timestamp: r.timestamp,
            read: r.read,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        connect("sqlite::memory:").await.unwrap()
    }

    fn base(id: &str, email: &str) -> UserBase {
        UserBase {
            id: id.into(),
            name: "Lin".into(),
            email: email.into(),
            phone: None,
            password_hash: "hash".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict_and_leaves_one_row() {
        let db = pool().await;
        insert_student(&db, &base("s1", "a@example.com")).await.unwrap();
        let err = insert_teacher(&db, &base("t1", "a@example.com"), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(&db).await.unwrap();
        assert_eq!(count, 1);
        assert!(find_user(&db, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_modules_go_first_and_progress_persists() {
        let db = pool().await;
        insert_student(&db, &base("s1", "a@example.com")).await.unwrap();
        let first = insert_module_with_questions(&db, "s1", "Algebra", &[]).await.unwrap();
        let second = insert_module_with_questions(&db, "s1", "Geometry", &[]).await.unwrap();
        assert!(second.position < first.position);

        let (modules, summary) = apply_progress(&db, "s1", &second.id, 95, 30).await.unwrap();
        assert_eq!(modules[0].id, second.id);
        assert_eq!(modules[0].status, ModuleStatus::Completed);
        assert_eq!(summary.topics_completed, 1);

        let stored = list_modules(&db, "s1").await.unwrap();
        assert_eq!(stored[0].mastery, 95);
        let err = apply_progress(&db, "s2", &second.id, 1, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("module")));
    }

    #[tokio::test]
    async fn resource_save_is_idempotent_by_uri() {
        let db = pool().await;
        insert_student(&db, &base("s1", "a@example.com")).await.unwrap();
        let resource = StudyResource {
            id: "r1".into(),
            title: "Notes".into(),
            uri: "https://example.edu/notes.pdf".into(),
            source: Some("example.edu".into()),
            kind: Some("PDF".into()),
            date_saved: Some(10),
        };
        let (_, created) = save_resource(&db, "s1", &resource).await.unwrap();
        assert!(created);
        let again = StudyResource { id: "r2".into(), ..resource };
        let (stored, created) = save_resource(&db, "s1", &again).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, "r1");
        assert_eq!(list_resources(&db, "s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_saves_of_one_uri_both_return_the_record() {
        let db = pool().await;
        insert_student(&db, &base("s1", "a@example.com")).await.unwrap();
        let make = |id: &str| StudyResource {
            id: id.into(),
            title: "Lecture".into(),
            uri: "https://example.edu/lecture".into(),
            source: None,
            kind: Some("WEB".into()),
            date_saved: None,
        };
        let (a, b) = (make("ra"), make("rb"));
        let (first, second) = tokio::join!(save_resource(&db, "s1", &a), save_resource(&db, "s1", &b));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.1 ^ second.1);
        assert_eq!(first.0.id, second.0.id);
        assert_eq!(list_resources(&db, "s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn visual_ids_are_scoped_per_student() {
        let db = pool().await;
        insert_student(&db, &base("s1", "a@example.com")).await.unwrap();
        insert_student(&db, &base("s2", "b@example.com")).await.unwrap();
        let visual = |owner: &str| Visual {
            id: "map-1".into(),
            kind: "mindmap".into(),
            title: "Cells".into(),
            data: serde_json::json!({"nodes": []}),
            created_at: 5,
            student_id: owner.into(),
        };
        insert_visual(&db, &visual("s1")).await.unwrap();
        insert_visual(&db, &visual("s2")).await.unwrap();
        let err = insert_visual(&db, &visual("s1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        delete_visual(&db, "s2", "map-1").await.unwrap();
        assert_eq!(list_visuals(&db, "s1").await.unwrap().len(), 1);
        assert!(list_visuals(&db, "s2").await.unwrap().is_empty());
    }
}
