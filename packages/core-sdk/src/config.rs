use std::path::PathBuf;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const DEFAULT_DB_PATH: &str = "panelchat.db";
pub const DEFAULT_LOG_DIR: &str = "logs";

/**
 * \brief 运行配置：默认值 + 环境变量覆盖，CLI 参数可再次覆盖。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /** \brief Gemini API 基地址（已规范化，包含版本段） */
    pub api_base: String,
    /** \brief 生成所用模型名 */
    pub model: String,
    /** \brief SQLite 数据库文件 */
    pub db_path: PathBuf,
    /** \brief 遥测日志目录 */
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl Config {
    /**
     * \brief 读取 PANELCHAT_* 环境变量构造配置。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            api_base: non_empty("PANELCHAT_API_BASE")
                .map(|base| normalize_api_base(&base))
                .unwrap_or(defaults.api_base),
            model: non_empty("PANELCHAT_MODEL").unwrap_or(defaults.model),
            db_path: non_empty("PANELCHAT_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: non_empty("PANELCHAT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
        }
    }
}

/**
 * \brief 规范化 API 基地址：去掉末尾斜杠，缺少版本段时补 `/v1beta`。
 */
pub fn normalize_api_base(api_base: &str) -> String {
    let trimmed = api_base.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
