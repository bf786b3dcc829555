use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tutor_backend::ai_client::{
    AiError, GenerateReply, GenerateRequest, GenerativeModel, GroundingChunk, SpeechRequest,
};
use tutor_backend::{build_state_with, config::Config, routes::build_router};

/// Answers every generate call with the same text, optionally after a delay.
struct ScriptedModel {
    text: String,
    grounding: Vec<GroundingChunk>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            grounding: Vec::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }
}

impl GenerativeModel for ScriptedModel {
    fn generate(&self, _request: GenerateRequest) -> BoxFuture<'static, Result<GenerateReply, AiError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = GenerateReply {
            text: self.text.clone(),
            grounding: self.grounding.clone(),
        };
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(reply)
        })
    }

    fn synthesize_speech(&self, _request: SpeechRequest) -> BoxFuture<'static, Result<Vec<u8>, AiError>> {
        Box::pin(async move { Ok(b"ID3-fake-mp3".to_vec()) })
    }
}

async fn spawn_with(model: Arc<dyn GenerativeModel>, ai_timeout: Duration) -> (String, reqwest::Client) {
    let mut config = Config::for_tests();
    config.ai_timeout = ai_timeout;
    let state = build_state_with(config, model).await.expect("state");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), reqwest::Client::new())
}

async fn spawn_server(model_text: &str) -> (String, reqwest::Client) {
    spawn_with(ScriptedModel::replying(model_text), Duration::from_secs(5)).await
}

async fn register(base: &str, client: &reqwest::Client, path: &str, email: &str) -> String {
    let resp = client
        .post(format!("{}{}", base, path))
        .json(&json!({"name": "Asha", "email": email, "password": "password123", "subject": "Physics"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

async fn login(base: &str, client: &reqwest::Client, email: &str) -> String {
    let resp = client
        .post(format!("{}/auth/login", base))
        .json(&json!({"email": email, "password": "password123"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["access_token"].as_str().unwrap().to_string()
}

/// Registers and logs in a student, returning (id, token).
async fn student(base: &str, client: &reqwest::Client, email: &str) -> (String, String) {
    let id = register(base, client, "/auth/register", email).await;
    (id, login(base, client, email).await)
}

async fn teacher(base: &str, client: &reqwest::Client, email: &str) -> (String, String) {
    let id = register(base, client, "/auth/register-teacher", email).await;
    (id, login(base, client, email).await)
}

async fn error_code(resp: reqwest::Response) -> String {
    let body: Value = resp.json().await.unwrap();
    body["error"]["code"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn duplicate_email_is_a_conflict() {
    let (base, client) = spawn_server("{}").await;
    register(&base, &client, "/auth/register", "dup@example.com").await;

    for path in ["/auth/register", "/auth/register-teacher"] {
        let resp = client
            .post(format!("{}{}", base, path))
            .json(&json!({"name": "Other", "email": "dup@example.com", "password": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(error_code(resp).await, "CONFLICT");
    }

    let students: Value = client
        .get(format!("{}/students/", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(students.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_registration_fields_are_reported() {
    let (base, client) = spawn_server("{}").await;
    let resp = client
        .post(format!("{}/auth/register", base))
        .json(&json!({"name": "No Password", "email": "np@example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"][0]["field"], "password");
}

#[tokio::test]
async fn wrong_password_never_yields_a_token() {
    let (base, client) = spawn_server("{}").await;
    register(&base, &client, "/auth/register", "pw@example.com").await;

    for body in [
        json!({"email": "pw@example.com", "password": "nope"}),
        json!({"email": "ghost@example.com", "password": "password123"}),
        json!({"email": "pw@example.com"}),
    ] {
        let resp = client
            .post(format!("{}/auth/login", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert!(body.get("access_token").is_none());
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }
}

#[tokio::test]
async fn token_resolves_to_the_registered_user() {
    let (base, client) = spawn_server("{}").await;
    let (id, token) = student(&base, &client, "me@example.com").await;
    assert!(id.starts_with('s'));

    let profile: Value = client
        .get(format!("{}/auth/profile", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(profile["id"], id.as_str());
    assert_eq!(profile["role"], "STUDENT");
    assert!(profile.get("password").is_none());

    let updated: Value = client
        .put(format!("{}/auth/profile", base))
        .bearer_auth(&token)
        .json(&json!({"bio": "Likes optics", "preferredLanguage": "Hindi"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["bio"], "Likes optics");
    assert_eq!(updated["preferredLanguage"], "Hindi");

    let anonymous = client.get(format!("{}/auth/profile", base)).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);
    let forged = client
        .get(format!("{}/auth/profile", base))
        .bearer_auth(format!("{token}x"))
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), 401);
}

#[tokio::test]
async fn fenced_json_reply_is_unwrapped() {
    let (base, client) = spawn_server("```json\n{\"a\":1}\n```").await;
    for (path, body) in [
        ("/mindmap/generate-mindmap", json!({"prompt": "Photosynthesis"})),
        ("/infographic/generate-infographic", json!({"prompt": "Water cycle"})),
        ("/ai/analyze-code", json!({"imageBase64": "aGVsbG8="})),
    ] {
        let resp = client
            .post(format!("{}{}", base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "{path}");
        let value: Value = resp.json().await.unwrap();
        assert_eq!(value, json!({"a": 1}));
    }
}

#[tokio::test]
async fn unparsable_reply_follows_each_endpoint_policy() {
    let (base, client) = spawn_server("not json").await;

    let mut envelopes = Vec::new();
    for _ in 0..2 {
        let resp = client
            .post(format!("{}/ai/socratic-chat", base))
            .json(&json!({"currentMessage": "why is the sky blue?", "history": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        envelopes.push(resp.json::<Value>().await.unwrap());
    }
    assert_eq!(envelopes[0], envelopes[1]);
    assert_eq!(envelopes[0]["tutor_response"], "not json");
    assert_eq!(envelopes[0]["detected_sentiment"], "NEUTRAL");
    assert_eq!(envelopes[0]["suggested_action"], "NONE");

    let title: Value = client
        .post(format!("{}/ai/generate-title", base))
        .json(&json!({"message": "help with fractions"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(title["title"], "not json");

    for (path, body) in [
        ("/ai/generate-quiz", json!({"topic": "Fractions"})),
        ("/ai/analyze-exam-trends", json!({"topic": "Fractions"})),
        ("/ai/expand-topic", json!({"topic": "Fractions"})),
        ("/ai/visualize-text", json!({"text": "Add the numerators."})),
        ("/mindmap/generate-mindmap", json!({"prompt": "Fractions"})),
    ] {
        for _ in 0..2 {
            let resp = client
                .post(format!("{}{}", base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 500, "{path}");
            assert_eq!(error_code(resp).await, "AI_INVALID_RESPONSE");
        }
    }
}

#[tokio::test]
async fn missing_ai_inputs_fail_before_any_upstream_call() {
    let model = ScriptedModel::replying("{}");
    let (base, client) = spawn_with(model.clone(), Duration::from_secs(5)).await;

    for (path, body) in [
        ("/ai/socratic-chat", json!({"history": []})),
        ("/ai/generate-title", json!({})),
        ("/ai/text-to-speech", json!({})),
        ("/ai/search-resources", json!({})),
        ("/ai/generate-quiz", json!({"difficulty": "Hard"})),
        ("/ai/transcribe-audio", json!({"audioBase64": "aGVsbG8="})),
        ("/ai/analyze-code", json!({"language": "rust"})),
        ("/ai/analyze-exam-trends", json!({})),
        ("/ai/expand-topic", json!({"context": "Biology"})),
        ("/ai/visualize-text", json!({})),
        ("/mindmap/generate-mindmap", json!({"prompt": ""})),
        ("/infographic/generate-infographic", json!({})),
        ("/ai/analyze-code", json!({"imageBase64": "%%% not base64 %%%"})),
        (
            "/ai/socratic-chat",
            json!({"currentMessage": "see image", "attachment": {"mimeType": "image/png", "data": "@@@"}}),
        ),
    ] {
        let resp = client
            .post(format!("{}{}", base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{path}");
        assert_eq!(error_code(resp).await, "VALIDATION_ERROR");
    }
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_model_maps_to_timeout() {
    let model = Arc::new(ScriptedModel {
        text: "{}".to_string(),
        grounding: Vec::new(),
        delay: Duration::from_secs(3),
        calls: AtomicUsize::new(0),
    });
    let (base, client) = spawn_with(model, Duration::from_millis(200)).await;
    let resp = client
        .post(format!("{}/ai/generate-quiz", base))
        .json(&json!({"topic": "Vectors"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    assert_eq!(error_code(resp).await, "AI_TIMEOUT");
}

#[tokio::test]
async fn generated_quiz_is_stamped_with_topic_and_module() {
    let (base, client) = spawn_server(
        r#"```json
{"questions": [{"id": 3, "question": "2+2?", "options": ["3", "4"], "correctAnswer": 1, "topic": "other"}]}
```"#,
    )
    .await;
    let quiz: Value = client
        .post(format!("{}/ai/generate-quiz", base))
        .json(&json!({"topic": "Arithmetic", "moduleId": "mod-9"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(quiz[0]["topic"], "Arithmetic");
    assert_eq!(quiz[0]["moduleId"], "mod-9");
    assert_eq!(quiz[0]["correctAnswer"], 1);
}

#[tokio::test]
async fn string_typed_quiz_fields_pass_through() {
    let (base, client) = spawn_server(
        r#"[{"id":"1","question":"Q?","options":["a","b"],"correctAnswer":"1"}]"#,
    )
    .await;
    let resp = client
        .post(format!("{}/ai/generate-quiz", base))
        .json(&json!({"topic": "Sets", "moduleId": "mod-3"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let quiz: Value = resp.json().await.unwrap();
    assert_eq!(quiz[0]["correctAnswer"], "1");
    assert_eq!(quiz[0]["id"], "1");
    assert_eq!(quiz[0]["topic"], "Sets");

    // The same questions can be stored as a module.
    let (_, token) = student(&base, &client, "sets@example.com").await;
    let created = client
        .post(format!("{}/modules/ai", base))
        .bearer_auth(&token)
        .json(&json!({"topic": "Sets", "questions": quiz}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let module_id = created["module"]["id"].as_str().unwrap().to_string();
    let stored: Value = client
        .get(format!("{}/modules/{}/questions", base, module_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored[0]["correctAnswer"], 1);
}

#[tokio::test]
async fn malformed_bodies_get_the_error_envelope() {
    let model = ScriptedModel::replying("{}");
    let (base, client) = spawn_with(model.clone(), Duration::from_secs(5)).await;

    let wrong_type = client
        .post(format!("{}/ai/socratic-chat", base))
        .json(&json!({"currentMessage": 5}))
        .send()
        .await
        .unwrap();
    let broken = client
        .post(format!("{}/auth/login", base))
        .header("content-type", "application/json")
        .body("{\"email\": ")
        .send()
        .await
        .unwrap();
    let untyped = client
        .post(format!("{}/auth/register", base))
        .body("name=Asha")
        .send()
        .await
        .unwrap();

    for resp in [wrong_type, broken, untyped] {
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"][0]["field"], "body");
        assert!(!body["error"]["request_id"].as_str().unwrap().is_empty());
    }
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_time_delta_is_rejected() {
    let (base, client) = spawn_server("{}").await;
    let (_, token) = student(&base, &client, "clock@example.com").await;
    let created: Value = client
        .post(format!("{}/modules/ai", base))
        .bearer_auth(&token)
        .json(&json!({
            "topic": "Kinematics",
            "questions": [{"question": "v = ?", "options": ["d/t", "t/d"], "correctAnswer": 0}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let module_id = created["module"]["id"].as_str().unwrap().to_string();
    let progress = |time: i64| {
        client
            .post(format!("{}/modules/{}/progress", base, module_id))
            .bearer_auth(&token)
            .json(&json!({"scoreDelta": 1, "timeSpentDelta": time}))
            .send()
    };

    assert_eq!(progress(120).await.unwrap().status(), 200);
    let resp = progress(i64::MAX).await.unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(error_code(resp).await, "VALIDATION_ERROR");

    let modules: Value = client
        .get(format!("{}/modules", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(modules[0]["timeSpent"], 120);
}

#[tokio::test]
async fn unknown_student_is_not_found() {
    let (base, client) = spawn_server("{}").await;
    let resp = client
        .get(format!("{}/students/s-does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body.get("id").is_none());
    assert!(body.get("modules").is_none());
}

#[tokio::test]
async fn saved_visuals_are_listed_newest_first_per_user() {
    let (base, client) = spawn_server("{}").await;
    let (owner_id, token) = student(&base, &client, "vis@example.com").await;
    let (_, other) = student(&base, &client, "other@example.com").await;

    let save = |id: &str, created_at: i64| {
        client
            .post(format!("{}/library/save", base))
            .bearer_auth(&token)
            .json(&json!({
                "id": id,
                "type": "mindmap",
                "title": format!("Map {id}"),
                "data": {"nodes": [{"id": "root", "label": "Root"}]},
                "createdAt": created_at
            }))
            .send()
    };

    assert_eq!(save("v1", 1_000).await.unwrap().status(), 201);
    let listed: Value = client
        .get(format!("{}/library/visuals", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "v1");
    assert_eq!(listed[0]["createdAt"], 1_000);
    assert_eq!(listed[0]["student_id"], owner_id.as_str());
    assert_eq!(listed[0]["data"]["nodes"][0]["label"], "Root");

    assert_eq!(save("v2", 2_000).await.unwrap().status(), 201);
    let dup = save("v1", 3_000).await.unwrap();
    assert_eq!(dup.status(), 400);
    assert_eq!(error_code(dup).await, "CONFLICT");

    let listed: Value = client
        .get(format!("{}/library/visuals", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listed.as_array().unwrap().iter().map(|v| v["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["v2", "v1"]);

    let foreign: Value = client
        .get(format!("{}/library/visuals", base))
        .bearer_auth(&other)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(foreign.as_array().unwrap().is_empty());

    // Ids only need to be unique per student.
    let reused = client
        .post(format!("{}/library/save", base))
        .bearer_auth(&other)
        .json(&json!({"id": "v1", "type": "infographic", "title": "Mine", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(reused.status(), 201);

    let resp = client
        .delete(format!("{}/library/visuals/v2", base))
        .bearer_auth(&other)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let unauthenticated = client.get(format!("{}/library/visuals", base)).send().await.unwrap();
    assert_eq!(unauthenticated.status(), 401);
}

#[tokio::test]
async fn search_results_can_be_saved_once() {
    let model = Arc::new(ScriptedModel {
        text: "Here are notes on thermodynamics.".to_string(),
        grounding: vec![
            GroundingChunk {
                uri: Some("https://uni.example.edu/thermo.pdf".into()),
                title: Some("Thermo notes".into()),
            },
            GroundingChunk {
                uri: Some("https://uni.example.edu/thermo.pdf".into()),
                title: Some("Thermo notes (mirror)".into()),
            },
            GroundingChunk {
                uri: None,
                title: Some("untitled".into()),
            },
        ],
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
    });
    let (base, client) = spawn_with(model, Duration::from_secs(5)).await;
    let (_, token) = student(&base, &client, "res@example.com").await;

    let found: Value = client
        .post(format!("{}/ai/search-resources", base))
        .json(&json!({"query": "thermodynamics"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["summary"], "Here are notes on thermodynamics.");
    let resources = found["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["type"], "PDF");
    assert_eq!(resources[0]["source"], "uni.example.edu");

    let save = || {
        client
            .post(format!("{}/library/resources", base))
            .bearer_auth(&token)
            .json(&json!({"title": "Thermo notes", "uri": "https://uni.example.edu/thermo.pdf"}))
            .send()
    };
    let first = save().await.unwrap();
    assert_eq!(first.status(), 201);
    let first: Value = first.json().await.unwrap();
    let second = save().await.unwrap();
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["type"], "PDF");

    let listed: Value = client
        .get(format!("{}/library/resources", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn teacher_routes_check_the_role() {
    let (base, client) = spawn_server("{}").await;
    let (student_id, student_token) = student(&base, &client, "kid@example.com").await;
    let (teacher_id, teacher_token) = teacher(&base, &client, "prof@example.com").await;
    assert!(teacher_id.starts_with('t'));

    let denied = client
        .get(format!("{}/teacher/interventions", base))
        .bearer_auth(&student_token)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);
    assert_eq!(error_code(denied).await, "FORBIDDEN");

    // A fresh student has zero mastery, so a derived HIGH flag shows up.
    let flags: Value = client
        .get(format!("{}/teacher/interventions", base))
        .bearer_auth(&teacher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let flags = flags.as_array().unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0]["studentId"], student_id.as_str());
    assert_eq!(flags[0]["severity"], "HIGH");

    let sent = client
        .post(format!("{}/teacher/messages", base))
        .bearer_auth(&teacher_token)
        .json(&json!({"studentId": student_id, "content": "Great work today"}))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), 201);
    let unknown = client
        .post(format!("{}/teacher/messages", base))
        .bearer_auth(&teacher_token)
        .json(&json!({"studentId": "s-nobody", "content": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let inbox: Value = client
        .get(format!("{}/messages", base))
        .bearer_auth(&student_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inbox[0]["content"], "Great work today");
    assert_eq!(inbox[0]["teacherName"], "Asha");
    assert_eq!(inbox[0]["read"], false);
}

#[tokio::test]
async fn distressed_chat_marks_student_at_risk_and_flags_teacher() {
    let (base, client) = spawn_server(
        &json!({
            "tutor_response": "Let's slow down. What part feels hardest?",
            "pedagogical_reasoning": "Student is frustrated; switching to an analogy.",
            "detected_sentiment": "FRUSTRATED",
            "suggested_action": "FLAG_TEACHER"
        })
        .to_string(),
    )
    .await;
    let (student_id, token) = student(&base, &client, "sad@example.com").await;
    let (_, teacher_token) = teacher(&base, &client, "watch@example.com").await;

    for _ in 0..3 {
        let resp = client
            .post(format!("{}/ai/socratic-chat", base))
            .bearer_auth(&token)
            .json(&json!({"currentMessage": "I don't get it", "language": "English"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let detail: Value = client
        .get(format!("{}/students/{}", base, student_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["atRisk"], true);
    assert_eq!(detail["sentimentTrend"].as_array().unwrap().len(), 3);

    let flags: Value = client
        .get(format!("{}/teacher/interventions", base))
        .bearer_auth(&teacher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stored: Vec<&Value> = flags
        .as_array()
        .unwrap()
        .iter()
        .filter(|f| f["studentId"] == student_id.as_str())
        .collect();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|f| f["severity"] == "HIGH"));

    let logs: Value = client
        .get(format!("{}/teacher/logs", base))
        .bearer_auth(&teacher_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs.as_array().unwrap().len(), 3);
    assert_eq!(logs[0]["studentInput"], "I don't get it");
}

#[tokio::test]
async fn module_progress_unlocks_and_updates_mastery() {
    let (base, client) = spawn_server("{}").await;
    let (student_id, token) = student(&base, &client, "learn@example.com").await;

    let created = client
        .post(format!("{}/modules/ai", base))
        .bearer_auth(&token)
        .json(&json!({
            "topic": "Optics",
            "questions": [
                {"question": "Speed of light?", "options": ["3e8 m/s", "3e5 m/s"], "correctAnswer": 0}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let module_id = created["module"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["module"]["status"], "IN_PROGRESS");

    let questions: Value = client
        .get(format!("{}/modules/{}/questions", base, module_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(questions[0]["topic"], "Optics");
    assert_eq!(questions[0]["options"][0], "3e8 m/s");

    let progress: Value = client
        .post(format!("{}/modules/{}/progress", base, module_id))
        .bearer_auth(&token)
        .json(&json!({"scoreDelta": 95, "timeSpentDelta": 12}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["modules"][0]["status"], "COMPLETED");
    assert_eq!(progress["masteryScore"], 95);
    assert_eq!(progress["topicsCompleted"], 1);

    let attempt = client
        .post(format!("{}/quiz/attempts", base))
        .bearer_auth(&token)
        .json(&json!({"moduleId": module_id, "score": 1, "maxScore": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(attempt.status(), 201);
    let too_high = client
        .post(format!("{}/quiz/attempts", base))
        .bearer_auth(&token)
        .json(&json!({"moduleId": module_id, "score": 4, "maxScore": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(too_high.status(), 400);

    let detail: Value = client
        .get(format!("{}/students/{}", base, student_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["masteryScore"], 95);
    assert_eq!(detail["modules"][0]["name"], "Optics");
}

#[tokio::test]
async fn conversations_are_scoped_to_their_owner() {
    let (base, client) = spawn_server("{}").await;
    let (_, token) = student(&base, &client, "chat@example.com").await;
    let (_, other) = student(&base, &client, "peer@example.com").await;

    let created: Value = client
        .post(format!("{}/conversations", base))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["title"], "New Chat");
    let conv_id = created["id"].as_str().unwrap().to_string();
    assert!(conv_id.starts_with("conv_"));

    for (role, content, ts) in [("user", "What is a prime?", 10), ("model", "What divides 7?", 20)] {
        let resp = client
            .post(format!("{}/conversations/{}/messages", base, conv_id))
            .bearer_auth(&token)
            .json(&json!({"role": role, "content": content, "timestamp": ts}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }
    let renamed = client
        .put(format!("{}/conversations/{}/title", base, conv_id))
        .bearer_auth(&token)
        .json(&json!({"title": "Primes"}))
        .send()
        .await
        .unwrap();
    assert_eq!(renamed.status(), 200);

    let full: Value = client
        .get(format!("{}/conversations/{}", base, conv_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(full["title"], "Primes");
    assert_eq!(full["messages"][0]["content"], "What is a prime?");
    assert_eq!(full["messages"][1]["role"], "model");

    let foreign = client
        .get(format!("{}/conversations/{}", base, conv_id))
        .bearer_auth(&other)
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);

    let bad_role = client
        .post(format!("{}/conversations/{}/messages", base, conv_id))
        .bearer_auth(&token)
        .json(&json!({"role": "system", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_role.status(), 400);
}

#[tokio::test]
async fn live_session_keeps_its_transcript() {
    let (base, client) = spawn_server("{}").await;
    let (_, token) = student(&base, &client, "live@example.com").await;

    let stored = client
        .post(format!("{}/live-sessions", base))
        .bearer_auth(&token)
        .json(&json!({
            "startTime": 1_000,
            "endTime": 5_000,
            "transcript": [
                {"role": "user", "text": "Hello tutor", "timestamp": 1_100},
                {"role": "model", "text": "Hi! What shall we study?", "timestamp": 1_200}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), 201);

    let reversed = client
        .post(format!("{}/live-sessions", base))
        .bearer_auth(&token)
        .json(&json!({"startTime": 5_000, "endTime": 1_000}))
        .send()
        .await
        .unwrap();
    assert_eq!(reversed.status(), 400);

    let sessions: Value = client
        .get(format!("{}/live-sessions", base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["transcript"][1]["text"], "Hi! What shall we study?");
}

#[tokio::test]
async fn speech_is_returned_as_base64() {
    let (base, client) = spawn_server("{}").await;
    let body: Value = client
        .post(format!("{}/ai/text-to-speech", base))
        .json(&json!({"text": "Hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["audio_content"], "SUQzLWZha2UtbXAz");
}
