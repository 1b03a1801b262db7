use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{
    ensure_success, into_chat_stream, parse_event_json, require_key, safety_advisory,
    scoped::ScopedStream,
    sse::{SseDecoder, SseEvent},
    ChatProvider, ChatStream, ClientOptions,
};
use crate::{
    error::LlmError,
    models::{ChatRequest, ProviderName},
};

pub const CLAUDE_MODELS: &[&str] = &[
    "claude-opus-4-1-20250805",
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20241022",
    "claude-3-5-sonnet-20240620",
    "claude-3-haiku-20240307",
];

const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/** \brief Anthropic 的 temperature 上限。 */
const MAX_TEMPERATURE: f32 = 1.0;

/**
 * \brief Anthropic Messages API 适配器。
 */
pub struct ClaudeAdapter {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl ClaudeAdapter {
    pub fn new(api_key: &str, options: &ClientOptions) -> Result<Self, LlmError> {
        let api_key = require_key(ProviderName::Anthropic, api_key)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key = HeaderValue::from_str(&api_key).map_err(|_| {
            LlmError::InvalidRequest("API key contains characters not allowed in a header".into())
        })?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(Self {
            client: options.build_client()?,
            base_url: options.resolve_base(ANTHROPIC_BASE),
            headers,
        })
    }
}

/**
 * \brief system 为独立顶层字段，消息按原角色传递。
 */
pub fn build_body(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature.clamp(0.0, MAX_TEMPERATURE),
        "stream": true,
    });
    if let Some(system) = request.system_instruction() {
        body["system"] = json!(system);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

#[derive(Debug, PartialEq, Eq)]
enum ClaudeEvent {
    Text(String),
    Refused,
    Stop,
    Skip,
}

fn parse_event(event: &SseEvent) -> Result<ClaudeEvent, LlmError> {
    let v = parse_event_json(&event.data)?;
    let kind = v
        .get("type")
        .and_then(|t| t.as_str())
        .or(event.event.as_deref())
        .unwrap_or_default();
    match kind {
        "content_block_delta" => Ok(v
            .pointer("/delta/text")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| ClaudeEvent::Text(t.to_string()))
            .unwrap_or(ClaudeEvent::Skip)),
        "message_delta" => {
            if v.pointer("/delta/stop_reason").and_then(|r| r.as_str()) == Some("refusal") {
                Ok(ClaudeEvent::Refused)
            } else {
                Ok(ClaudeEvent::Skip)
            }
        }
        "message_stop" => Ok(ClaudeEvent::Stop),
        "error" => Err(LlmError::Api {
            vendor: ProviderName::Anthropic,
            message: v
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        }),
        _ => Ok(ClaudeEvent::Skip),
    }
}

impl ChatProvider for ClaudeAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Anthropic
    }

    fn get_models(&self) -> &'static [&'static str] {
        CLAUDE_MODELS
    }

    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        request.validate()?;
        let body = build_body(&request);
        let client = self.client.clone();
        let headers = self.headers.clone();
        let url = format!("{}/v1/messages", self.base_url);

        let out = try_stream! {
            tracing::debug!(vendor = "Anthropic", model = %request.model, msgs = request.messages.len(), "chat request");
            let resp = client.post(&url).headers(headers).json(&body).send().await?;
            let resp = ensure_success(ProviderName::Anthropic, resp).await?;

            // 句柄随本生成器一同析构：完成、出错或消费方放弃时都会释放。
            let mut handle = ScopedStream::new("anthropic.messages", resp.bytes_stream());
            let mut decoder = SseDecoder::new();
            'read: while let Some(chunk) = handle.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk) {
                    match parse_event(&event)? {
                        ClaudeEvent::Text(text) => {
                            yield text;
                        }
                        ClaudeEvent::Refused => {
                            tracing::warn!(vendor = "Anthropic", "model refused to continue");
                            yield safety_advisory(ProviderName::Anthropic);
                            break 'read;
                        }
                        ClaudeEvent::Stop => break 'read,
                        ClaudeEvent::Skip => {}
                    }
                }
            }
        };

        Ok(into_chat_stream(out))
    }
}
