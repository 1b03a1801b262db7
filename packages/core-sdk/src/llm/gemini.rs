use async_stream::try_stream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{
    ensure_success, into_chat_stream, parse_event_json, require_key, safety_advisory,
    sse::SseDecoder, ChatProvider, ChatStream, ClientOptions,
};
use crate::{
    error::LlmError,
    models::{ChatMessage, ChatRequest, ProviderName, Role},
};

pub const GEMINI_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.5-pro"];

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/** \brief 默认阈值可能静默截断正常内容，这里显式放宽到仅拦截高风险。 */
const SAFETY_THRESHOLD: &str = "BLOCK_ONLY_HIGH";

const BLOCKING_FINISH_REASONS: [&str; 5] =
    ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII", "RECITATION"];

/**
 * \brief Gemini generateContent 适配器。
 */
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiAdapter {
    pub fn new(api_key: &str, options: &ClientOptions) -> Result<Self, LlmError> {
        let api_key = require_key(ProviderName::Google, api_key)?;
        Ok(Self {
            client: options.build_client()?,
            base_url: options.resolve_base(GEMINI_BASE),
            api_key,
        })
    }
}

fn to_content(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::Assistant => "model",
        Role::User => "user",
    };
    json!({"role": role, "parts": [{"text": message.content}]})
}

/**
 * \brief 拆分历史与本轮消息：最后一条为 user 时作为触发轮次单独发送，
 *        否则返回 `None`（不触发生成）。
 */
pub fn split_history(messages: &[ChatMessage]) -> Option<(Vec<Value>, Value)> {
    let (last, prior) = messages.split_last()?;
    if last.role != Role::User {
        return None;
    }
    Some((prior.iter().map(to_content).collect(), to_content(last)))
}

pub fn safety_settings() -> Vec<Value> {
    HARM_CATEGORIES
        .iter()
        .map(|category| json!({"category": category, "threshold": SAFETY_THRESHOLD}))
        .collect()
}

pub fn build_body(request: &ChatRequest, history: Vec<Value>, turn: Value) -> Value {
    let mut contents = history;
    contents.push(turn);

    let mut generation_config = json!({ "temperature": request.temperature });
    if let Some(max_tokens) = request.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
        "safetySettings": safety_settings(),
    });
    if let Some(system) = request.system_instruction() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

#[derive(Debug, Default, PartialEq, Eq)]
struct GeminiChunk {
    texts: Vec<String>,
    blocked: Option<String>,
}

fn parse_chunk(data: &str) -> Result<GeminiChunk, LlmError> {
    let v = parse_event_json(data)?;
    if let Some(err) = v.get("error") {
        return Err(LlmError::Api {
            vendor: ProviderName::Google,
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    let mut chunk = GeminiChunk::default();
    if let Some(reason) = v
        .pointer("/promptFeedback/blockReason")
        .and_then(|r| r.as_str())
    {
        chunk.blocked = Some(reason.to_string());
        return Ok(chunk);
    }

    if let Some(candidate) = v.get("candidates").and_then(|c| c.get(0)) {
        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            chunk.texts = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string())
                .collect();
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            if BLOCKING_FINISH_REASONS.contains(&reason) {
                chunk.blocked = Some(reason.to_string());
            }
        }
    }
    Ok(chunk)
}

fn model_path(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

impl ChatProvider for GeminiAdapter {
    fn name(&self) -> ProviderName {
        ProviderName::Google
    }

    fn get_models(&self) -> &'static [&'static str] {
        GEMINI_MODELS
    }

    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        request.validate()?;
        let Some((history, turn)) = split_history(&request.messages) else {
            tracing::debug!("last message is not a user turn, nothing to generate");
            return Ok(into_chat_stream(futures_util::stream::empty()));
        };

        let body = build_body(&request, history, turn);
        let client = self.client.clone();
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url,
            model_path(&request.model)
        );
        let api_key = self.api_key.clone();

        let out = try_stream! {
            tracing::debug!(vendor = "Google", model = %request.model, msgs = request.messages.len(), "chat request");
            let resp = client
                .post(&url)
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", api_key.as_str())
                .json(&body)
                .send()
                .await?;
            let resp = ensure_success(ProviderName::Google, resp).await?;

            let mut bytes = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut pending = Vec::new();
            'read: loop {
                let next = bytes.next().await;
                let exhausted = next.is_none();
                match next {
                    Some(chunk) => pending.extend(decoder.push(&chunk?)),
                    None => pending.extend(decoder.finish()),
                }
                for event in pending.drain(..) {
                    let parsed = parse_chunk(&event.data)?;
                    for text in parsed.texts {
                        yield text;
                    }
                    if let Some(reason) = parsed.blocked {
                        tracing::warn!(vendor = "Google", %reason, "generation blocked by safety filter");
                        yield safety_advisory(ProviderName::Google);
                        break 'read;
                    }
                }
                if exhausted {
                    break;
                }
            }
        };

        Ok(into_chat_stream(out))
    }
}
