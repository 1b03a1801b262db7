use thiserror::Error;

use crate::{models::ProviderName, store::DocId};

/**
 * \brief 错误大类：配置错误阻断流程，传输错误原地标注。
 * \details 内容策略拦截不是错误，适配器以 `safety_advisory` 文本片段结束流。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Transport,
}

/**
 * \brief Provider 层错误。
 */
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API key for {0} is required")]
    MissingCredential(ProviderName),

    #[error("provider `{0}` is not supported")]
    UnsupportedProvider(String),

    #[error("invalid chat request: {0}")]
    InvalidRequest(String),

    #[error("{vendor} request failed: {status} -> {body}")]
    Status {
        vendor: ProviderName,
        status: u16,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{vendor} API error: {message}")]
    Api {
        vendor: ProviderName,
        message: String,
    },

    #[error("malformed stream event: {0}")]
    Protocol(String),
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::MissingCredential(_)
            | LlmError::UnsupportedProvider(_)
            | LlmError::InvalidRequest(_) => ErrorClass::Configuration,
            LlmError::Status { .. }
            | LlmError::Transport(_)
            | LlmError::Api { .. }
            | LlmError::Protocol(_) => ErrorClass::Transport,
        }
    }
}

/**
 * \brief 模板校验错误。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template name must not be empty")]
    EmptyName,

    #[error("a template named `{0}` already exists")]
    DuplicateName(String),

    #[error("template references undeclared variables: {}", .0.join(", "))]
    UndeclaredVariables(Vec<String>),

    #[error("missing values for variables: {}", .0.join(", "))]
    MissingValues(Vec<String>),

    #[error("template {0} not found")]
    NotFound(DocId),
}
