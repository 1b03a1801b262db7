use async_stream::try_stream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{
    ensure_success, into_chat_stream, parse_event_json, require_key, safety_advisory,
    sse::{SseDecoder, SseEvent},
    ChatProvider, ChatStream, ClientOptions,
};
use crate::{
    error::LlmError,
    models::{ChatRequest, ProviderName},
};

pub const OPENAI_MODELS: &[&str] = &["gpt-4.1-mini", "gpt-4.1-nano", "gpt-4o-mini"];
pub const DEEPSEEK_MODELS: &[&str] = &["deepseek-chat", "deepseek-coder"];

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE: &str = "https://api.deepseek.com/v1";

/**
 * \brief OpenAI Chat Completions 兼容接口的适配器（OpenAI、DeepSeek）。
 */
pub struct OpenAiAdapter {
    vendor: ProviderName,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    models: &'static [&'static str],
}

impl OpenAiAdapter {
    pub fn openai(api_key: &str, options: &ClientOptions) -> Result<Self, LlmError> {
        Self::with_vendor(ProviderName::OpenAI, OPENAI_BASE, OPENAI_MODELS, api_key, options)
    }

    pub fn deepseek(api_key: &str, options: &ClientOptions) -> Result<Self, LlmError> {
        Self::with_vendor(
            ProviderName::DeepSeek,
            DEEPSEEK_BASE,
            DEEPSEEK_MODELS,
            api_key,
            options,
        )
    }

    fn with_vendor(
        vendor: ProviderName,
        default_base: &str,
        models: &'static [&'static str],
        api_key: &str,
        options: &ClientOptions,
    ) -> Result<Self, LlmError> {
        let api_key = require_key(vendor, api_key)?;
        Ok(Self {
            vendor,
            client: options.build_client()?,
            base_url: options.resolve_base(default_base),
            api_key,
            models,
        })
    }
}

/**
 * \brief 系统指令作为首条 system 消息放在对话之前；空白指令不发送。
 */
pub fn build_messages(request: &ChatRequest) -> Vec<Value> {
    request
        .system_instruction()
        .map(|system| json!({"role": "system", "content": system}))
        .into_iter()
        .chain(
            request
                .messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
        )
        .collect()
}

pub fn build_body(request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": build_messages(request),
        "temperature": request.temperature,
        "stream": true,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

#[derive(Debug, PartialEq, Eq)]
enum OpenAiEvent {
    Delta(String),
    Blocked,
    Done,
    Skip,
}

fn parse_event(vendor: ProviderName, event: &SseEvent) -> Result<OpenAiEvent, LlmError> {
    if event.is_done() {
        return Ok(OpenAiEvent::Done);
    }
    let v = parse_event_json(&event.data)?;
    if let Some(err) = v.get("error") {
        return Err(LlmError::Api {
            vendor,
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    let choice = match v.get("choices").and_then(|c| c.get(0)) {
        Some(choice) => choice,
        None => return Ok(OpenAiEvent::Skip),
    };
    if choice.get("finish_reason").and_then(|r| r.as_str()) == Some("content_filter") {
        return Ok(OpenAiEvent::Blocked);
    }
    Ok(choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| OpenAiEvent::Delta(s.to_string()))
        .unwrap_or(OpenAiEvent::Skip))
}

impl ChatProvider for OpenAiAdapter {
    fn name(&self) -> ProviderName {
        self.vendor
    }

    fn get_models(&self) -> &'static [&'static str] {
        self.models
    }

    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        request.validate()?;
        let vendor = self.vendor;
        let body = build_body(&request);
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = self.api_key.clone();

        let out = try_stream! {
            tracing::debug!(%vendor, model = %request.model, msgs = request.messages.len(), "chat request");
            let resp = client.post(&url).bearer_auth(&api_key).json(&body).send().await?;
            let resp = ensure_success(vendor, resp).await?;

            let mut bytes = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut finished = false;
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk) {
                    match parse_event(vendor, &event)? {
                        OpenAiEvent::Delta(text) => {
                            yield text;
                        }
                        OpenAiEvent::Blocked => {
                            tracing::warn!(%vendor, "completion stopped by content filter");
                            yield safety_advisory(vendor);
                            finished = true;
                            break 'read;
                        }
                        OpenAiEvent::Done => {
                            finished = true;
                            break 'read;
                        }
                        OpenAiEvent::Skip => {}
                    }
                }
            }
            if !finished {
                if let Some(event) = decoder.finish() {
                    if let OpenAiEvent::Delta(text) = parse_event(vendor, &event)? {
                        yield text;
                    }
                }
            }
        };

        Ok(into_chat_stream(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_system_prompt_is_first_message() {
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("Hi")])
            .with_system_prompt("Be terse.");
        let messages = build_messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], json!({"role": "system", "content": "Be terse."}));
        assert_eq!(messages[1], json!({"role": "user", "content": "Hi"}));
    }

    #[test]
    fn test_blank_system_prompt_sends_no_system_message() {
        for system in ["", "  \n"] {
            let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("Hi")])
                .with_system_prompt(system);
            let messages = build_messages(&request);
            assert_eq!(messages, vec![json!({"role": "user", "content": "Hi"})]);
        }
    }

    #[test]
    fn test_max_tokens_omitted_when_unset() {
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("Hi")]);
        let body = build_body(&request);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream"], json!(true));

        let body = build_body(&request.with_max_tokens(Some(512)));
        assert_eq!(body["max_tokens"], json!(512));
    }

    #[test]
    fn test_parse_delta_skips_empty_content() {
        let vendor = ProviderName::OpenAI;
        assert_eq!(
            parse_event(vendor, &event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)).unwrap(),
            OpenAiEvent::Delta("Hel".into())
        );
        assert_eq!(
            parse_event(vendor, &event(r#"{"choices":[{"delta":{"content":""}}]}"#)).unwrap(),
            OpenAiEvent::Skip
        );
        assert_eq!(
            parse_event(vendor, &event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)).unwrap(),
            OpenAiEvent::Skip
        );
        assert_eq!(
            parse_event(vendor, &event("[DONE]")).unwrap(),
            OpenAiEvent::Done
        );
    }

    #[test]
    fn test_parse_content_filter_and_error() {
        let vendor = ProviderName::DeepSeek;
        assert_eq!(
            parse_event(
                vendor,
                &event(r#"{"choices":[{"delta":{},"finish_reason":"content_filter"}]}"#)
            )
            .unwrap(),
            OpenAiEvent::Blocked
        );
        let err = parse_event(vendor, &event(r#"{"error":{"message":"overloaded"}}"#)).unwrap_err();
        assert!(matches!(err, LlmError::Api { message, .. } if message == "overloaded"));
        assert!(matches!(
            parse_event(vendor, &event("not json")),
            Err(LlmError::Protocol(_))
        ));
    }
}
