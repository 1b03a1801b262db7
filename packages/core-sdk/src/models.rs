use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::LlmError, store::DocId};

/**
 * \brief 对话角色；系统指令不进入消息序列，由 `ChatRequest::system_prompt` 单独携带。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 消息结构，按追加顺序构成一次会话。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 统一的聊天请求，由各厂商适配器翻译成原生调用。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    /** \brief 0.0–2.0；各适配器按厂商上限再行裁剪。 */
    pub temperature: f32,
    /** \brief 未设置时适配器必须省略对应字段，不得替换为默认值。 */
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: String,
}

impl ChatRequest {
    pub const MAX_TEMPERATURE: f32 = 2.0;

    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /** \brief 需要发送的系统指令；空白指令视为未设置，各厂商均不发送。 */
    pub fn system_instruction(&self) -> Option<&str> {
        Some(self.system_prompt.as_str()).filter(|s| !s.trim().is_empty())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /**
     * \brief 在任何网络调用前校验请求。
     */
    pub fn validate(&self) -> Result<(), LlmError> {
        let first = self
            .messages
            .first()
            .ok_or_else(|| LlmError::InvalidRequest("messages must not be empty".into()))?;
        if first.role != Role::User {
            return Err(LlmError::InvalidRequest(
                "conversation must start with a user turn".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(LlmError::InvalidRequest("model must not be empty".into()));
        }
        if !self.temperature.is_finite()
            || self.temperature < 0.0
            || self.temperature > Self::MAX_TEMPERATURE
        {
            return Err(LlmError::InvalidRequest(format!(
                "temperature {} outside [0, {}]",
                self.temperature,
                Self::MAX_TEMPERATURE
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(LlmError::InvalidRequest(
                "max_tokens must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/**
 * \brief 支持的厂商。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderName {
    OpenAI,
    Google,
    Anthropic,
    DeepSeek,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        ProviderName::OpenAI,
        ProviderName::Google,
        ProviderName::Anthropic,
        ProviderName::DeepSeek,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderName::OpenAI => "OpenAI",
            ProviderName::Google => "Google",
            ProviderName::Anthropic => "Anthropic",
            ProviderName::DeepSeek => "DeepSeek",
        }
    }

    /**
     * \brief 读取凭据时使用的环境变量名（按优先级）。
     */
    pub fn key_env_vars(self) -> &'static [&'static str] {
        match self {
            ProviderName::OpenAI => &["OPENAI_API_KEY"],
            ProviderName::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
            ProviderName::Anthropic => &["ANTHROPIC_API_KEY"],
            ProviderName::DeepSeek => &["DEEPSEEK_API_KEY"],
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderName::OpenAI),
            "google" | "gemini" => Ok(ProviderName::Google),
            "anthropic" | "claude" => Ok(ProviderName::Anthropic),
            "deepseek" => Ok(ProviderName::DeepSeek),
            _ => Err(LlmError::UnsupportedProvider(s.to_string())),
        }
    }
}

/**
 * \brief 每次请求/会话临时构造的 Provider 配置，不落库。
 */
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_name: ProviderName,
    /** \brief 凭据，`Debug` 输出时被遮蔽。 */
    pub api_key: String,
    pub model: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_name", &self.provider_name)
            .field("api_key", &"***")
            .field("model", &self.model)
            .finish()
    }
}

/**
 * \brief 模板变量类型，仅作为取值表单的展示提示。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    Text,
    Number,
    Textarea,
    Date,
}

impl VariableKind {
    /**
     * \brief 日期变量的最终文本形式（日/月/年）。
     */
    pub fn format_date(date: time::Date) -> String {
        format!(
            "{:02}/{:02}/{}",
            date.day(),
            u8::from(date.month()),
            date.year()
        )
    }

    /**
     * \brief 规范化表单取值：日期接受 `YYYY-MM-DD` 并转成日/月/年，其余原样保留。
     */
    pub fn normalize(self, raw: &str) -> String {
        if self == VariableKind::Date {
            let iso = time::macros::format_description!("[year]-[month]-[day]");
            if let Ok(date) = time::Date::parse(raw.trim(), iso) {
                return Self::format_date(date);
            }
        }
        raw.to_string()
    }
}

impl FromStr for VariableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(VariableKind::Text),
            "number" => Ok(VariableKind::Number),
            "textarea" => Ok(VariableKind::Textarea),
            "date" => Ok(VariableKind::Date),
            other => Err(format!("unknown variable type `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VariableKind,
    #[serde(default)]
    pub description: String,
}

impl VariableSpec {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Text,
            description: String::new(),
        }
    }
}

/**
 * \brief 带变量的提示词模板。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /** \brief 文档主键（保存后才有）。 */
    #[serde(skip)]
    pub id: Option<DocId>,
    pub name: String,
    pub template_content: String,
    /** \brief 保持声明顺序。 */
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub used_count: u64,
}

/**
 * \brief 系统提示词记录，不做变量替换。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    #[serde(skip)]
    pub id: Option<DocId>,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    #[serde(default)]
    pub used_count: u64,
}

/**
 * \brief 已保存的聊天会话。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    #[serde(skip)]
    pub id: Option<DocId>,
    pub session_name: String,
    pub provider: ProviderName,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ChatSession {
    pub fn new(
        provider: ProviderName,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let session_name = now
            .format(time::macros::format_description!(
                "Chat [hour]:[minute] [day]-[month]-[year]"
            ))
            .unwrap_or_else(|_| "Chat".to_string());
        Self {
            id: None,
            session_name,
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
