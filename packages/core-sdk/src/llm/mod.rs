pub mod claude;
#[cfg(test)]
pub(crate) mod fake;
pub mod gemini;
pub mod openai;
pub mod scoped;
pub mod sse;

use std::{pin::Pin, str::FromStr, time::Duration};

use futures_util::{Stream, StreamExt};

use crate::{
    error::LlmError,
    models::{ChatRequest, ProviderConfig, ProviderName},
};

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/**
 * \brief 惰性文本片段流：首次 poll 前不发起任何网络请求；出现 `Err` 后流即终止。
 */
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send + 'static>>;

/**
 * \brief 所有厂商适配器共同遵守的契约。
 */
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /** \brief 静态模型列表，不访问网络。 */
    fn get_models(&self) -> &'static [&'static str];

    /**
     * \brief 返回惰性流。外层 `Err` 为发起请求前即可确定的配置类错误。
     */
    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError>;
}

/**
 * \brief HTTP 客户端选项；超时属于传输层，抽象本身不强制。
 */
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    /** \brief 覆盖厂商默认地址（代理、测试）。 */
    pub base_url: Option<String>,
}

impl ClientOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub(crate) fn build_client(&self) -> Result<reqwest::Client, LlmError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        Ok(builder.build()?)
    }

    pub(crate) fn resolve_base(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

/**
 * \brief 按厂商区分的适配器集合。
 */
pub enum LlmProvider {
    OpenAI(OpenAiAdapter),
    Google(GeminiAdapter),
    Anthropic(ClaudeAdapter),
    DeepSeek(OpenAiAdapter),
}

impl LlmProvider {
    fn adapter(&self) -> &dyn ChatProvider {
        match self {
            LlmProvider::OpenAI(a) | LlmProvider::DeepSeek(a) => a as &dyn ChatProvider,
            LlmProvider::Google(a) => a,
            LlmProvider::Anthropic(a) => a,
        }
    }
}

impl ChatProvider for LlmProvider {
    fn name(&self) -> ProviderName {
        self.adapter().name()
    }

    fn get_models(&self) -> &'static [&'static str] {
        self.adapter().get_models()
    }

    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        self.adapter().chat_stream(request)
    }
}

type Constructor = fn(&str, &ClientOptions) -> Result<LlmProvider, LlmError>;

static REGISTRY: &[(ProviderName, Constructor)] = &[
    (ProviderName::OpenAI, build_openai),
    (ProviderName::Google, build_google),
    (ProviderName::Anthropic, build_anthropic),
    (ProviderName::DeepSeek, build_deepseek),
];

fn build_openai(key: &str, opts: &ClientOptions) -> Result<LlmProvider, LlmError> {
    OpenAiAdapter::openai(key, opts).map(LlmProvider::OpenAI)
}

fn build_google(key: &str, opts: &ClientOptions) -> Result<LlmProvider, LlmError> {
    GeminiAdapter::new(key, opts).map(LlmProvider::Google)
}

fn build_anthropic(key: &str, opts: &ClientOptions) -> Result<LlmProvider, LlmError> {
    ClaudeAdapter::new(key, opts).map(LlmProvider::Anthropic)
}

fn build_deepseek(key: &str, opts: &ClientOptions) -> Result<LlmProvider, LlmError> {
    OpenAiAdapter::deepseek(key, opts).map(LlmProvider::DeepSeek)
}

/**
 * \brief 工厂：按名称构造适配器。
 * \details 未知名称返回 `UnsupportedProvider`；凭据为空由适配器构造函数返回 `MissingCredential`。
 */
pub fn get_llm_provider(name: &str, api_key: &str) -> Result<LlmProvider, LlmError> {
    get_llm_provider_with(name, api_key, &ClientOptions::default())
}

pub fn get_llm_provider_with(
    name: &str,
    api_key: &str,
    options: &ClientOptions,
) -> Result<LlmProvider, LlmError> {
    let provider = ProviderName::from_str(name)?;
    let (_, constructor) = REGISTRY
        .iter()
        .find(|(candidate, _)| *candidate == provider)
        .ok_or_else(|| LlmError::UnsupportedProvider(name.to_string()))?;
    constructor(api_key, options)
}

/** \brief 由已解析的 `ProviderConfig` 构造适配器。 */
pub fn provider_for(
    config: &ProviderConfig,
    options: &ClientOptions,
) -> Result<LlmProvider, LlmError> {
    get_llm_provider_with(config.provider_name.as_str(), &config.api_key, options)
}

/**
 * \brief 不发起请求即可得到的模型列表。
 */
pub fn models_for(provider: ProviderName) -> &'static [&'static str] {
    match provider {
        ProviderName::OpenAI => openai::OPENAI_MODELS,
        ProviderName::DeepSeek => openai::DEEPSEEK_MODELS,
        ProviderName::Google => gemini::GEMINI_MODELS,
        ProviderName::Anthropic => claude::CLAUDE_MODELS,
    }
}

/**
 * \brief 安全过滤拦截时代替异常输出的提示片段。
 */
pub fn safety_advisory(vendor: ProviderName) -> String {
    format!(
        "⚠️ 内容被 {} 的安全过滤器拦截。请改写内容后重试，或切换到其他模型/服务商。",
        vendor
    )
}

pub(crate) fn require_key(vendor: ProviderName, api_key: &str) -> Result<String, LlmError> {
    let key = api_key.trim();
    if key.is_empty() {
        return Err(LlmError::MissingCredential(vendor));
    }
    Ok(key.to_string())
}

pub(crate) async fn ensure_success(
    vendor: ProviderName,
    resp: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(%vendor, status, "vendor rejected chat request");
    Err(LlmError::Status {
        vendor,
        status,
        body,
    })
}

pub(crate) fn parse_event_json(data: &str) -> Result<serde_json::Value, LlmError> {
    serde_json::from_str(data).map_err(|e| LlmError::Protocol(format!("{}: {}", e, data)))
}

/**
 * \brief 把 `try_stream!` 的产物装箱为 `ChatStream`，同时固定错误类型。
 */
pub(crate) fn into_chat_stream<S>(stream: S) -> ChatStream
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    Box::pin(stream.filter(|item| {
        let keep = !matches!(item, Ok(text) if text.is_empty());
        async move { keep }
    }))
}
