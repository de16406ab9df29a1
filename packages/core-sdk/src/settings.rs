use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::db::{self, SharedConnection};
use crate::error::ChatResult;
use crate::llm::GenerativeApi;
use crate::telemetry;

/** \brief Gemini API Key 的固定前缀。 */
pub const KEY_PREFIX: &str = "AIza";
/** \brief 状态提示自动消失的时长。 */
pub const STATUS_DISPLAY: Duration = Duration::from_secs(3);

pub const INVALID_FORMAT_MESSAGE: &str = "Please enter a valid Gemini API key";
pub const SAVE_OK_MESSAGE: &str = "API key saved successfully";
pub const SAVE_FAILED_MESSAGE: &str = "Failed to save API key. Please check if it's valid.";
pub const CLEAR_OK_MESSAGE: &str = "API key cleared successfully";
pub const CLEAR_FAILED_MESSAGE: &str = "Failed to clear API key";

/**
 * \brief 校验密钥格式：非空且以 AIza 开头。
 */
pub fn validate_key_format(key: &str) -> bool {
    !key.is_empty() && key.starts_with(KEY_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
}

/**
 * \brief 设置页的瞬时状态提示。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
    pub icon: &'static str,
    pub dismiss_after_ms: u64,
}

impl Status {
    pub fn success(message: &str) -> Self {
        Self::new(StatusKind::Success, message)
    }

    pub fn error(message: &str) -> Self {
        Self::new(StatusKind::Error, message)
    }

    fn new(kind: StatusKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
            icon: match kind {
                StatusKind::Success => "check_circle",
                StatusKind::Error => "error",
            },
            dismiss_after_ms: STATUS_DISPLAY.as_millis() as u64,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == StatusKind::Error
    }

    /**
     * \brief 自显示起经过 `elapsed` 后是否仍应可见。
     */
    pub fn visible_after(&self, elapsed: Duration) -> bool {
        elapsed < Duration::from_millis(self.dismiss_after_ms)
    }
}

/**
 * \brief 密钥输入框的显示方式，只影响展示。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyVisibility {
    #[default]
    Obscured,
    Plain,
}

impl KeyVisibility {
    pub fn toggled(self) -> Self {
        match self {
            KeyVisibility::Obscured => KeyVisibility::Plain,
            KeyVisibility::Plain => KeyVisibility::Obscured,
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            KeyVisibility::Obscured => "visibility_off",
            KeyVisibility::Plain => "visibility",
        }
    }

    /** \brief 切换按钮的提示文字。 */
    pub fn toggle_title(self) -> &'static str {
        match self {
            KeyVisibility::Obscured => "Show API key",
            KeyVisibility::Plain => "Hide API key",
        }
    }

    pub fn render(self, key: &str) -> String {
        match self {
            KeyVisibility::Plain => key.to_string(),
            KeyVisibility::Obscured => "•".repeat(key.chars().count()),
        }
    }
}

/**
 * \brief 设置页：直接管理存储中的 API Key。
 */
pub struct SettingsPanel {
    conn: SharedConnection,
    api: Arc<dyn GenerativeApi>,
    visibility: KeyVisibility,
}

impl SettingsPanel {
    pub fn new(conn: SharedConnection, api: Arc<dyn GenerativeApi>) -> Self {
        Self {
            conn,
            api,
            visibility: KeyVisibility::default(),
        }
    }

    /**
     * \brief 读取已保存的密钥，用于回填输入框。
     */
    pub fn load(&self) -> ChatResult<Option<String>> {
        Ok(db::with_conn(&self.conn, db::get_api_key)?)
    }

    /**
     * \brief 保存密钥：格式校验 → 探活 → 持久化。
     */
    pub async fn save(&self, raw_key: &str) -> Status {
        let key = raw_key.trim();
        if !validate_key_format(key) {
            return Status::error(INVALID_FORMAT_MESSAGE);
        }
        match self.verify_and_store(key).await {
            Ok(()) => {
                telemetry::log_event("settings.key", "api key saved");
                Status::success(SAVE_OK_MESSAGE)
            }
            Err(e) => {
                telemetry::log_error("settings.key", &format!("save failed: {}", e));
                Status::error(SAVE_FAILED_MESSAGE)
            }
        }
    }

    async fn verify_and_store(&self, key: &str) -> ChatResult<()> {
        self.api.probe_key(key).await?;
        db::with_conn(&self.conn, |conn| db::set_api_key(conn, key))?;
        Ok(())
    }

    /**
     * \brief 无条件删除密钥。
     */
    pub fn clear(&self) -> Status {
        match db::with_conn(&self.conn, db::remove_api_key) {
            Ok(()) => {
                telemetry::log_event("settings.key", "api key cleared");
                Status::success(CLEAR_OK_MESSAGE)
            }
            Err(e) => {
                telemetry::log_error("settings.key", &format!("clear failed: {}", e));
                Status::error(CLEAR_FAILED_MESSAGE)
            }
        }
    }

    pub fn visibility(&self) -> KeyVisibility {
        self.visibility
    }

    pub fn toggle_visibility(&mut self) -> KeyVisibility {
        self.visibility = self.visibility.toggled();
        self.visibility
    }

    /**
     * \brief 按当前显示方式渲染密钥。
     */
    pub fn display_key(&self, key: &str) -> String {
        self.visibility.render(key)
    }
}
