pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod history;
pub mod llm;
pub mod models;
pub mod panel;
pub mod protocol;
pub mod router;
pub mod server;
pub mod settings;
pub mod telemetry;

#[cfg(test)]
mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db;
    pub use crate::error::{ChatError, ChatResult};
    pub use crate::format::{tokenize, Span};
    pub use crate::history::ConversationHistory;
    pub use crate::llm::{GeminiClient, GenerativeApi};
    pub use crate::models::{Message, Role, TurnId};
    pub use crate::panel::{Author, ChatPanel, SendAttempt};
    pub use crate::protocol::{PanelEvent, PanelRequest};
    pub use crate::router::MessageRouter;
    pub use crate::server;
    pub use crate::settings::{SettingsPanel, Status};
    pub use crate::telemetry;
}
