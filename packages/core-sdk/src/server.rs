use std::{
    collections::HashMap,
    convert::Infallible,
    fmt::Display,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    analysis::{self, AnalysisSettings, AnalysisTask},
    chat::{self, TurnSettings},
    config::AppConfig,
    db::{self, TemplateDraft, TemplateQuery},
    error::{ErrorClass, LlmError, TemplateError},
    llm::{self, ChatProvider, LlmProvider},
    models::{ChatSession, ProviderName, VariableSpec},
    store::{DocId, SqliteStore},
    telemetry,
    template,
};

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

/**
 * \brief 服务共享状态：配置与按访问组缓存的存储句柄。
 */
#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    stores: Arc<Mutex<HashMap<PathBuf, Arc<SqliteStore>>>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /**
     * \brief 取得访问组对应的存储，首次访问时打开并缓存。
     */
    fn store(&self, group: Option<&str>) -> Result<Arc<SqliteStore>, ApiError> {
        let group = self.config.group_or_default(group).map_err(bad_request)?;
        let path = self.config.store_path(&group);
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| internal_err("store cache poisoned"))?;
        if let Some(store) = stores.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SqliteStore::open(&path).map_err(internal_err)?);
        tracing::info!(group = %group, "access group store opened");
        stores.insert(path, Arc::clone(&store));
        Ok(store)
    }
}

/**
 * \brief 仅包含 API 路由的 Router，便于测试时挂载。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/providers", get(list_providers))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/prompts", get(list_prompts).post(create_prompt))
        .route("/api/prompts/{id}", put(update_prompt).delete(delete_prompt))
        .route("/api/templates", get(list_templates).post(create_template))
        .route("/api/templates/inspect", post(inspect_template))
        .route(
            "/api/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/api/templates/{id}/render", post(render_template))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/chat/sse", post(chat_sse))
        .route("/api/analyze", post(analyze))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 */
pub async fn run(config: AppConfig) -> Result<()> {
    let addr = config.addr.clone();
    let static_service = get_service(
        ServeDir::new(&config.ui_dir).append_index_html_on_directories(true),
    );
    telemetry::set_log_dir(config.log_dir.clone());
    let state = AppState::new(config);

    let store = state
        .store(None)
        .map_err(|(_, msg)| anyhow!("open default store: {}", msg))?;
    telemetry::set_enabled(db::get_telemetry_enabled(store.as_ref())?);

    let app = router(state).fallback_service(static_service);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn internal_err<E: Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found(what: &str, id: DocId) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{} {} not found", what, id))
}

/**
 * \brief 校验与配置类错误为 400，缺失文档为 404，其余为 500。
 */
fn classify(err: anyhow::Error) -> ApiError {
    if let Some(t) = err.downcast_ref::<TemplateError>() {
        return match t {
            TemplateError::NotFound(_) => (StatusCode::NOT_FOUND, t.to_string()),
            _ => bad_request(t),
        };
    }
    if let Some(e) = err.downcast_ref::<LlmError>() {
        if e.class() == ErrorClass::Configuration {
            return bad_request(e);
        }
    }
    internal_err(format!("{:#}", err))
}

fn llm_err(err: LlmError) -> ApiError {
    match err.class() {
        ErrorClass::Configuration => bad_request(err),
        _ => internal_err(err),
    }
}

/** \brief 响应中附带文档 id。 */
#[derive(Serialize, Debug)]
struct WithId<T> {
    id: Option<DocId>,
    #[serde(flatten)]
    item: T,
}

#[derive(Deserialize, Debug, Default)]
struct GroupQuery {
    group: Option<String>,
}

/**
 * \brief 健康检查。
 */
async fn health_check() -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "telemetry": telemetry::is_enabled(),
    }))
}

/**
 * \brief 列出支持的厂商、模型以及是否已配置凭据（不返回凭据本身）。
 */
async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = ProviderName::ALL
        .iter()
        .map(|p| {
            json!({
                "name": p.as_str(),
                "models": llm::models_for(*p),
                "has_key": state.config.api_key_for(*p).is_some(),
            })
        })
        .collect();
    Json(json!({ "providers": providers }))
}

#[derive(Deserialize, Debug)]
struct ConfigInput {
    telemetry_enabled: bool,
}

async fn get_config(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let enabled = db::get_telemetry_enabled(store.as_ref()).map_err(classify)?;
    Ok(Json(json!({
        "telemetry_enabled": enabled,
        "default_group": state.config.default_group.as_str(),
    })))
}

async fn set_config(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
    Json(input): Json<ConfigInput>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    db::set_telemetry_enabled(store.as_ref(), input.telemetry_enabled).map_err(classify)?;
    telemetry::set_enabled(input.telemetry_enabled);
    Ok(Json(json!({ "telemetry_enabled": input.telemetry_enabled })))
}

/* ---------- 提示词 ---------- */

#[derive(Deserialize, Debug)]
struct PromptInput {
    name: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let prompts: Vec<_> = db::list_prompts(store.as_ref())
        .map_err(classify)?
        .into_iter()
        .map(|p| WithId { id: p.id, item: p })
        .collect();
    Ok(Json(json!({ "prompts": prompts })))
}

async fn create_prompt(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
    Json(input): Json<PromptInput>,
) -> ApiResult<Value> {
    if input.name.trim().is_empty() {
        return Err(bad_request("prompt name must not be empty"));
    }
    let store = state.store(q.group.as_deref())?;
    let id = db::insert_prompt(store.as_ref(), &input.name, &input.content, &input.tags)
        .map_err(classify)?;
    telemetry::log_event("server.prompt", &format!("create id={}", id));
    Ok(Json(json!({ "id": id })))
}

async fn update_prompt(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
    Json(input): Json<PromptInput>,
) -> ApiResult<Value> {
    if input.name.trim().is_empty() {
        return Err(bad_request("prompt name must not be empty"));
    }
    let store = state.store(q.group.as_deref())?;
    if !db::update_prompt(store.as_ref(), id, &input.name, &input.content, &input.tags)
        .map_err(classify)?
    {
        return Err(not_found("prompt", id));
    }
    Ok(Json(json!({ "id": id })))
}

async fn delete_prompt(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    if !db::delete_prompt(store.as_ref(), id).map_err(classify)? {
        return Err(not_found("prompt", id));
    }
    telemetry::log_event("server.prompt", &format!("delete id={}", id));
    Ok(Json(json!({ "deleted": id })))
}

/* ---------- 模板 ---------- */

async fn list_templates(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
    Query(filter): Query<TemplateQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let templates: Vec<_> = db::list_templates(store.as_ref(), &filter)
        .map_err(classify)?
        .into_iter()
        .map(|t| WithId { id: t.id, item: t })
        .collect();
    Ok(Json(json!({ "templates": templates })))
}

async fn create_template(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let id = db::insert_template(store.as_ref(), &draft).map_err(classify)?;
    telemetry::log_event("server.template", &format!("create id={} name={}", id, draft.name));
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize, Debug)]
struct InspectInput {
    template_content: String,
    #[serde(default)]
    variables: Vec<VariableSpec>,
}

/**
 * \brief 不落库地分析模板：提取变量、对比声明并给出建议声明。
 */
async fn inspect_template(Json(input): Json<InspectInput>) -> Json<Value> {
    let report = template::validate_template(&input.template_content, &input.variables);
    Json(json!({
        "variables": template::extract_variables(&input.template_content),
        "missing": report.missing,
        "extra": report.extra,
        "suggested": template::infer_variable_specs(&input.template_content, &input.variables),
    }))
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let template = db::get_template(store.as_ref(), id)
        .map_err(classify)?
        .ok_or_else(|| not_found("template", id))?;
    Ok(Json(json!(WithId {
        id: template.id,
        item: template
    })))
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    db::update_template(store.as_ref(), id, &draft).map_err(classify)?;
    Ok(Json(json!({ "id": id })))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    if !db::delete_template(store.as_ref(), id).map_err(classify)? {
        return Err(not_found("template", id));
    }
    telemetry::log_event("server.template", &format!("delete id={}", id));
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize, Debug)]
struct RenderInput {
    #[serde(default)]
    values: HashMap<String, String>,
}

async fn render_template(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
    Json(input): Json<RenderInput>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let rendered =
        db::render_saved_template(store.as_ref(), id, &input.values).map_err(classify)?;
    Ok(Json(json!({ "rendered": rendered })))
}

/* ---------- 会话 ---------- */

async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let sessions: Vec<Value> = db::list_chat_sessions(store.as_ref())
        .map_err(classify)?
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "session_name": s.session_name,
                "provider": s.provider,
                "model": s.model,
                "turns": s.history.len(),
                "updated_at": s.updated_at.unix_timestamp(),
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    let session = db::get_chat_session(store.as_ref(), id)
        .map_err(classify)?
        .ok_or_else(|| not_found("session", id))?;
    Ok(Json(json!(WithId {
        id: session.id,
        item: session
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<DocId>,
    Query(q): Query<GroupQuery>,
) -> ApiResult<Value> {
    let store = state.store(q.group.as_deref())?;
    if !db::delete_chat_session(store.as_ref(), id).map_err(classify)? {
        return Err(not_found("session", id));
    }
    Ok(Json(json!({ "deleted": id })))
}

/* ---------- 对话与分析 ---------- */

#[derive(Deserialize, Debug)]
struct ProviderSelection {
    provider: String,
    #[serde(default)]
    model: Option<String>,
    /** \brief 可选，缺省时使用环境变量中的凭据。 */
    #[serde(default)]
    api_key: Option<String>,
}

impl ProviderSelection {
    fn build(&self, config: &AppConfig) -> Result<(LlmProvider, String), ApiError> {
        let chosen = config
            .provider_config(&self.provider, self.model.as_deref(), self.api_key.as_deref())
            .map_err(llm_err)?;
        let options = config.client_options(chosen.provider_name);
        let provider = llm::provider_for(&chosen, &options).map_err(llm_err)?;
        Ok((provider, chosen.model))
    }
}

#[derive(Deserialize, Debug)]
struct ChatInput {
    #[serde(flatten)]
    selection: ProviderSelection,
    #[serde(default)]
    session_id: Option<DocId>,
    #[serde(default)]
    system_prompt: Option<String>,
    message: String,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

/**
 * \brief 聊天 SSE 流接口：POST /api/chat/sse。
 * \details 先推送 `meta`（会话 id），随后逐片推送 `data`，中途失败推送 `error`，
 *          结束时推送 `done` 并保存会话。
 */
async fn chat_sse(
    State(state): State<AppState>,
    Query(q): Query<GroupQuery>,
    Json(input): Json<ChatInput>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if input.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let store = state.store(q.group.as_deref())?;
    telemetry::set_enabled(db::get_telemetry_enabled(store.as_ref()).map_err(classify)?);

    let (provider, model) = input.selection.build(&state.config)?;
    let mut session = match input.session_id {
        Some(id) => db::get_chat_session(store.as_ref(), id)
            .map_err(classify)?
            .ok_or_else(|| not_found("session", id))?,
        None => ChatSession::new(
            provider.name(),
            model.clone(),
            input.system_prompt.clone().unwrap_or_default(),
        ),
    };
    session.provider = provider.name();
    session.model = model;
    if let Some(system_prompt) = input.system_prompt {
        session.system_prompt = system_prompt;
    }

    let defaults = TurnSettings::default();
    let settings = TurnSettings {
        temperature: input.temperature.unwrap_or(defaults.temperature),
        max_tokens: input.max_tokens,
    };
    let message = input.message;
    // 校验先于落库：被拒的请求不留下空会话。
    chat::turn_request(&session, &message, settings)
        .validate()
        .map_err(llm_err)?;
    let session_id = db::save_chat_session(store.as_ref(), &mut session).map_err(classify)?;

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default()
        .event("meta")
        .data(json!({ "session_id": session_id, "model": session.model }).to_string())));

    tokio::spawn(async move {
        telemetry::log_event(
            "server.chat",
            &format!(
                "provider={} model={} session={} prompt_len={}",
                session.provider,
                session.model,
                session_id,
                message.len()
            ),
        );
        let chunk_tx = tx.clone();
        let turn = chat::run_turn(&provider, &mut session, &message, settings, |chunk| {
            let _ = chunk_tx.send(Ok(Event::default().data(chunk)));
        })
        .await;

        match turn {
            Ok(outcome) => {
                if let Some(err) = &outcome.failure {
                    telemetry::log_error("server.chat", &format!("stream error: {}", err));
                    let _ = tx.send(Ok(Event::default().event("error").data(err.to_string())));
                }
                if let Err(err) = db::save_chat_session(store.as_ref(), &mut session) {
                    telemetry::log_error("server.chat", &format!("save session failed: {:#}", err));
                }
                let _ = tx.send(Ok(Event::default()
                    .event("done")
                    .data(json!({ "session_id": session_id }).to_string())));
            }
            Err(err) => {
                telemetry::log_error("server.chat", &format!("request rejected: {}", err));
                let _ = tx.send(Ok(Event::default().event("error").data(err.to_string())));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

#[derive(Deserialize, Debug)]
struct AnalyzeInput {
    #[serde(flatten)]
    selection: ProviderSelection,
    text: String,
    #[serde(default)]
    target_language: Option<String>,
    /** \brief 自定义任务；缺省为翻译、摘要、词汇三项。 */
    #[serde(default)]
    tasks: Option<Vec<AnalysisTask>>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn analyze(
    State(state): State<AppState>,
    Json(input): Json<AnalyzeInput>,
) -> ApiResult<Value> {
    let (provider, model) = input.selection.build(&state.config)?;
    let tasks = input.tasks.unwrap_or_else(|| {
        analysis::default_tasks(input.target_language.as_deref().unwrap_or("English"))
    });
    let mut settings = AnalysisSettings::new(model);
    if let Some(temperature) = input.temperature {
        settings.temperature = temperature;
    }
    settings.max_tokens = input.max_tokens;

    let provider: Arc<dyn ChatProvider> = Arc::new(provider);
    let results = analysis::run_analysis(provider, &settings, &input.text, &tasks)
        .await
        .map_err(llm_err)?;
    telemetry::log_event(
        "server.analyze",
        &format!("tasks={} chars={}", tasks.len(), input.text.len()),
    );
    Ok(Json(json!({ "results": results })))
}
