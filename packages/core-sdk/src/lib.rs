pub mod analysis;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod template;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块与类型。
 */
pub mod prelude {
    pub use crate::config::{AccessGroup, AppConfig};
    pub use crate::error::{ErrorClass, LlmError, TemplateError};
    pub use crate::llm::{get_llm_provider, get_llm_provider_with, ChatProvider, ChatStream};
    pub use crate::models::{ChatMessage, ChatRequest, ChatSession, ProviderName, Role};
    pub use crate::store::{DocumentStore, SqliteStore};
    pub use crate::template::{extract_variables, render_template, validate_template};
    pub use crate::{analysis, chat, db, llm, models, server, telemetry, template};
}
