use std::collections::HashMap;

use reqwest::StatusCode;
use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use promptdeck_core_sdk::{
    config::AppConfig,
    server::{router, AppState},
};

struct TestServer {
    base: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(&[]).await
    }

    async fn start_with(extra: &[(&'static str, String)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let mut vars: HashMap<&str, String> = HashMap::from([("PROMPTDECK_DATA_DIR", data_dir)]);
        vars.extend(extra.iter().cloned());
        let config = AppConfig::from_lookup(move |key| vars.get(key).cloned()).expect("config");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(AppState::new(config));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request");
        Self::read(resp).await
    }

    /** 读完整个 SSE 响应体。 */
    async fn post_sse(&self, path: &str, body: Value) -> (StatusCode, String) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request");
        let status = resp.status();
        (status, resp.text().await.expect("body"))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.expect("request");
        Self::read(resp).await
    }

    async fn read(resp: reqwest::Response) -> (StatusCode, Value) {
        let status = resp.status();
        let text = resp.text().await.expect("body");
        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        (status, value)
    }
}

#[tokio::test]
async fn test_health_reports_version_and_telemetry_flag() {
    let server = TestServer::start().await;
    let (status, health) = server.get("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ok"], json!(true));
    assert!(health["version"].is_string());
    assert!(health["telemetry"].is_boolean());
}

#[tokio::test]
async fn test_template_lifecycle_over_http() {
    let server = TestServer::start().await;

    let (status, created) = server
        .post(
            "/api/templates",
            json!({
                "name": "greeting",
                "template_content": "Hello {name}, welcome to {place}!",
                "variables": [
                    {"name": "name", "type": "text"},
                    {"name": "place", "type": "text", "description": "city"}
                ],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_i64().expect("id");

    let (status, rendered) = server
        .post(
            &format!("/api/templates/{}/render", id),
            json!({"values": {"name": "Ada", "place": "Paris"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rendered["rendered"], json!("Hello Ada, welcome to Paris!"));

    let (status, missing) = server
        .post(
            &format!("/api/templates/{}/render", id),
            json!({"values": {"name": "Ada"}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(missing.as_str().expect("message").contains("place"));

    let (status, fetched) = server.get(&format!("/api/templates/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], json!(id));
    assert_eq!(fetched["used_count"], json!(1));

    let (status, listed) = server.get("/api/templates?search=GREET&sort=most_used").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["templates"].as_array().expect("list").len(), 1);
}

#[tokio::test]
async fn test_template_validation_errors_map_to_client_statuses() {
    let server = TestServer::start().await;

    let (status, _) = server
        .post(
            "/api/templates",
            json!({"name": "broken", "template_content": "Hi {who}", "variables": []}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post(
            "/api/templates",
            json!({"name": "  ", "template_content": "static text"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.get("/api/templates/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .post("/api/templates/999/render", json!({"values": {}}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_inspect_reports_missing_and_extra_variables() {
    let server = TestServer::start().await;
    let (status, report) = server
        .post(
            "/api/templates/inspect",
            json!({
                "template_content": "Dear {name}, see {topic}",
                "variables": [{"name": "name"}, {"name": "unused"}],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["variables"], json!(["name", "topic"]));
    assert_eq!(report["missing"], json!(["topic"]));
    assert_eq!(report["extra"], json!(["unused"]));
}

#[tokio::test]
async fn test_chat_rejects_bad_provider_selection_before_streaming() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/api/chat/sse",
            json!({"provider": "Mistral", "message": "Hi"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.as_str().expect("message").contains("Mistral"));

    let (status, _) = server
        .post(
            "/api/chat/sse",
            json!({"provider": "Anthropic", "message": "Hi"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, sessions) = server.get("/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions["sessions"], json!([]));
}

#[tokio::test]
async fn test_chat_rejects_invalid_settings_without_saving_session() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/api/chat/sse",
            json!({"provider": "OpenAI", "api_key": "sk-x", "message": "Hi", "temperature": 5.0}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.as_str().expect("message").contains("temperature"));

    let (status, _) = server
        .post(
            "/api/chat/sse",
            json!({"provider": "OpenAI", "api_key": "sk-x", "message": "Hi", "max_tokens": 0}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, sessions) = server.get("/api/sessions").await;
    assert_eq!(sessions["sessions"], json!([]));
}

async fn vendor_replying(events: &[&str]) -> MockServer {
    let vendor = MockServer::start().await;
    let body: String = events.iter().map(|e| format!("{}\n\n", e)).collect();
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&vendor)
        .await;
    vendor
}

async fn chat_against(vendor: &MockServer) -> (TestServer, String) {
    let server = TestServer::start_with(&[
        ("PROMPTDECK_OPENAI_BASE_URL", vendor.uri()),
        ("OPENAI_API_KEY", "sk-env".to_string()),
    ])
    .await;
    let (status, body) = server
        .post_sse(
            "/api/chat/sse",
            json!({"provider": "OpenAI", "model": "gpt-4o-mini", "message": "Hi"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    (server, body)
}

async fn only_session(server: &TestServer) -> Value {
    let (_, sessions) = server.get("/api/sessions").await;
    let sessions = sessions["sessions"].as_array().expect("sessions").clone();
    assert_eq!(sessions.len(), 1);
    let id = sessions[0]["id"].as_i64().expect("session id");
    let (status, session) = server.get(&format!("/api/sessions/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    session
}

#[tokio::test]
async fn test_chat_streams_vendor_chunks_and_saves_turn() {
    let vendor = vendor_replying(&[
        r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
        "data: [DONE]",
    ])
    .await;
    let (server, body) = chat_against(&vendor).await;

    assert!(body.contains("event: meta"));
    assert!(body.contains("data: Hel"));
    assert!(body.contains("data: lo"));
    assert!(body.contains("event: done"));
    assert!(!body.contains("event: error"));

    let session = only_session(&server).await;
    assert_eq!(
        session["history"],
        json!([
            {"role": "user", "content": "Hi"},
            {"role": "assistant", "content": "Hello"}
        ])
    );
}

#[tokio::test]
async fn test_chat_reports_mid_stream_failure_and_keeps_partial_reply() {
    let vendor = vendor_replying(&[
        r#"data: {"choices":[{"delta":{"content":"Par"}}]}"#,
        "data: {not json",
    ])
    .await;
    let (server, body) = chat_against(&vendor).await;

    assert!(body.contains("data: Par"));
    assert!(body.contains("event: error"));
    assert!(body.contains("event: done"));

    let session = only_session(&server).await;
    let history = session["history"].as_array().expect("history");
    assert_eq!(history.len(), 2);
    let reply = history[1]["content"].as_str().expect("reply");
    assert!(reply.starts_with("Par"));
    assert!(reply.contains("❌"));
}

#[tokio::test]
async fn test_groups_are_isolated() {
    let server = TestServer::start().await;

    let (status, _) = server
        .post(
            "/api/prompts?group=team-a",
            json!({"name": "Reviewer", "content": "You review code.", "tags": ["dev", " dev "]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, team_a) = server.get("/api/prompts?group=team-a").await;
    let prompts = team_a["prompts"].as_array().expect("prompts");
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0]["tags"], json!(["dev"]));

    let (_, team_b) = server.get("/api/prompts?group=team-b").await;
    assert_eq!(team_b["prompts"], json!([]));

    let (status, _) = server.get("/api/prompts?group=../escape").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
