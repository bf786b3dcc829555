use crate::handlers::{ai, auth, library, students, tutoring};
use crate::state::AppState;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ]);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring invalid CORS origin {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/auth/register", post(auth::register))
        .route("/auth/register-teacher", post(auth::register_teacher))
        .route("/auth/login", post(auth::login))
        .route("/auth/profile", get(auth::profile).put(auth::update_profile))
        .route("/students", get(students::list_students))
        .route("/students/", get(students::list_students))
        .route("/students/:id", get(students::get_student))
        .route("/library/save", post(library::save_visual))
        .route("/library/visuals", get(library::list_visuals))
        .route("/library/visuals/:id", delete(library::delete_visual))
        .route(
            "/library/resources",
            post(library::save_resource).get(library::list_resources),
        )
        .route("/library/resources/:id", delete(library::delete_resource))
        .route(
            "/conversations",
            post(tutoring::create_conversation).get(tutoring::list_conversations),
        )
        .route("/conversations/:id", get(tutoring::get_conversation))
        .route("/conversations/:id/messages", post(tutoring::append_message))
        .route("/conversations/:id/title", put(tutoring::rename_conversation))
        .route("/modules", get(tutoring::list_modules))
        .route("/modules/ai", post(tutoring::create_ai_module))
        .route("/modules/:id/questions", get(tutoring::module_questions))
        .route("/modules/:id/progress", post(tutoring::record_progress))
        .route(
            "/quiz/attempts",
            post(tutoring::record_attempt).get(tutoring::list_attempts),
        )
        .route(
            "/live-sessions",
            post(tutoring::record_live_session).get(tutoring::list_live_sessions),
        )
        .route("/teacher/interventions", get(tutoring::list_interventions))
        .route("/teacher/logs", get(tutoring::list_decision_logs))
        .route("/teacher/messages", post(tutoring::send_teacher_message))
        .route("/messages", get(tutoring::list_my_messages))
        .route("/ai/socratic-chat", post(ai::socratic_chat))
        .route("/ai/generate-title", post(ai::generate_title))
        .route("/ai/text-to-speech", post(ai::text_to_speech))
        .route("/ai/search-resources", post(ai::search_resources))
        .route("/ai/generate-quiz", post(ai::generate_quiz))
        .route("/ai/transcribe-audio", post(ai::transcribe_audio))
        .route("/ai/analyze-code", post(ai::analyze_code))
        .route("/ai/analyze-exam-trends", post(ai::analyze_exam_trends))
        .route("/ai/expand-topic", post(ai::expand_topic))
        .route("/ai/visualize-text", post(ai::visualize_text))
        .route("/mindmap/generate-mindmap", post(ai::generate_mindmap))
        .route("/infographic/generate-infographic", post(ai::generate_infographic))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
