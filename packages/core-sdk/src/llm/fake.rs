use std::sync::Mutex;

use futures_util::stream;

use super::{ChatProvider, ChatStream};
use crate::{
    error::LlmError,
    models::{ChatRequest, ProviderName},
};

type Responder = Box<dyn Fn(&ChatRequest) -> Vec<Result<String, LlmError>> + Send + Sync>;

/**
 * \brief 测试用 Provider：按脚本产出片段并记录收到的请求。
 */
pub(crate) struct ScriptedProvider {
    responder: Responder,
    pub(crate) seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn from_fn(
        f: impl Fn(&ChatRequest) -> Vec<Result<String, LlmError>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(f),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn replying(chunks: &[&str]) -> Self {
        let chunks: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
        Self::from_fn(move |_| chunks.iter().cloned().map(Ok).collect())
    }

    pub(crate) fn failing_after(chunks: &[&str], message: &str) -> Self {
        let chunks: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
        let message = message.to_string();
        Self::from_fn(move |_| {
            let mut items: Vec<Result<String, LlmError>> =
                chunks.iter().cloned().map(Ok).collect();
            items.push(Err(LlmError::Protocol(message.clone())));
            items
        })
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl ChatProvider for ScriptedProvider {
    fn name(&self) -> ProviderName {
        ProviderName::OpenAI
    }

    fn get_models(&self) -> &'static [&'static str] {
        &["scripted"]
    }

    fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        request.validate()?;
        let items = (self.responder)(&request);
        self.seen.lock().expect("seen lock").push(request);
        Ok(Box::pin(stream::iter(items)))
    }
}
