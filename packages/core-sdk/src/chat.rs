use futures_util::StreamExt;

use crate::{
    error::LlmError,
    llm::{ChatProvider, ChatStream},
    models::{ChatMessage, ChatRequest, ChatSession},
};

/**
 * \brief 单轮对话的生成参数。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnSettings {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/**
 * \brief 一轮对话的结果；`failure` 为流中途的错误（已写入回复标注）。
 */
#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: String,
    pub failure: Option<LlmError>,
}

/**
 * \brief 在错误前已收到的文本之后追加错误标注。
 */
pub fn annotate_failure(partial: &str, err: &LlmError) -> String {
    let note = format!("❌ {}", err);
    if partial.is_empty() {
        note
    } else {
        format!("{}\n\n{}", partial, note)
    }
}

/**
 * \brief 把整条流拼接成完整回复，遇到首个错误即返回。
 */
pub async fn collect_reply(mut stream: ChatStream) -> Result<String, LlmError> {
    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        reply.push_str(&chunk?);
    }
    Ok(reply)
}

/**
 * \brief 构造本轮发送的请求：已有历史加上新的用户消息，会话本身不变。
 */
pub fn turn_request(session: &ChatSession, user_text: &str, settings: TurnSettings) -> ChatRequest {
    let mut messages = session.history.clone();
    messages.push(ChatMessage::user(user_text));
    ChatRequest::new(session.model.clone(), messages)
        .with_system_prompt(session.system_prompt.clone())
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens)
}

/**
 * \brief 执行一轮对话：追加用户消息，流式消费回复并逐片交给 `on_chunk`，最后追加助手消息。
 * \details 请求被拒（配置类错误）时返回 `Err` 且会话不变；
 *          流中途失败时保留已收到的文本并附加错误标注。
 */
pub async fn run_turn<F>(
    provider: &dyn ChatProvider,
    session: &mut ChatSession,
    user_text: &str,
    settings: TurnSettings,
    mut on_chunk: F,
) -> Result<TurnOutcome, LlmError>
where
    F: FnMut(&str),
{
    let mut stream = provider.chat_stream(turn_request(session, user_text, settings))?;
    session.history.push(ChatMessage::user(user_text));

    let mut reply = String::new();
    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                on_chunk(&chunk);
                reply.push_str(&chunk);
            }
            Err(err) => {
                tracing::warn!(vendor = %provider.name(), error = %err, "chat stream failed mid-turn");
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = &failure {
        reply = annotate_failure(&reply, err);
    }
    session.history.push(ChatMessage::assistant(reply.clone()));
    tracing::debug!(turns = session.history.len(), chars = reply.len(), "chat turn finished");
    Ok(TurnOutcome { reply, failure })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorClass,
        llm::fake::ScriptedProvider,
        models::{ProviderName, Role},
    };

    fn session() -> ChatSession {
        ChatSession::new(ProviderName::OpenAI, "scripted", "Be helpful.")
    }

    #[tokio::test]
    async fn test_turn_appends_user_and_assistant() {
        let provider = ScriptedProvider::replying(&["Hel", "lo", "!"]);
        let mut session = session();
        let mut seen = Vec::new();
        let outcome = run_turn(&provider, &mut session, "Hi", TurnSettings::default(), |c| {
            seen.push(c.to_string())
        })
        .await
        .expect("turn");

        assert_eq!(outcome.reply, "Hello!");
        assert!(outcome.failure.is_none());
        assert_eq!(seen, vec!["Hel", "lo", "!"]);
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0], ChatMessage::user("Hi"));
        assert_eq!(session.history[1], ChatMessage::assistant("Hello!"));

        let requests = provider.requests();
        assert_eq!(requests[0].system_prompt, "Be helpful.");
        assert_eq!(requests[0].messages, vec![ChatMessage::user("Hi")]);
    }

    #[tokio::test]
    async fn test_second_turn_sends_full_history() {
        let provider = ScriptedProvider::replying(&["ok"]);
        let mut session = session();
        for text in ["one", "two"] {
            run_turn(&provider, &mut session, text, TurnSettings::default(), |_| {})
                .await
                .expect("turn");
        }
        let requests = provider.requests();
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(session.history.len(), 4);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_partial_text() {
        let provider = ScriptedProvider::failing_after(&["partial "], "connection reset");
        let mut session = session();
        let outcome = run_turn(&provider, &mut session, "Hi", TurnSettings::default(), |_| {})
            .await
            .expect("turn still completes");

        assert!(outcome.failure.is_some());
        assert!(outcome.reply.starts_with("partial "));
        assert!(outcome.reply.contains("❌"));
        assert!(outcome.reply.contains("connection reset"));
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].content, outcome.reply);
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_session_untouched() {
        let provider = ScriptedProvider::replying(&["never"]);
        let mut session = session();
        let settings = TurnSettings {
            temperature: 3.5,
            max_tokens: None,
        };
        let err = run_turn(&provider, &mut session, "Hi", settings, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn test_collect_reply_stops_at_error() {
        let provider = ScriptedProvider::failing_after(&["a", "b"], "boom");
        let stream = provider
            .chat_stream(ChatRequest::new("m", vec![ChatMessage::user("x")]))
            .expect("stream");
        assert!(matches!(
            collect_reply(stream).await,
            Err(LlmError::Protocol(msg)) if msg == "boom"
        ));
    }

    #[test]
    fn test_annotation_without_partial_text() {
        let err = LlmError::Protocol("bad frame".into());
        assert_eq!(annotate_failure("", &err), "❌ malformed stream event: bad frame");
    }

    #[test]
    fn test_turn_request_leaves_session_untouched() {
        let session = session();
        let request = turn_request(
            &session,
            "Hi",
            TurnSettings {
                temperature: 5.0,
                max_tokens: None,
            },
        );
        assert_eq!(request.messages, vec![ChatMessage::user("Hi")]);
        assert_eq!(request.system_instruction(), Some("Be helpful."));
        assert!(matches!(request.validate(), Err(LlmError::InvalidRequest(_))));
        assert!(session.history.is_empty());
    }
}
