use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::DEFAULT_LOG_DIR;

const LOG_FILE: &str = "panelchat.log";

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));
static LOG_DIR: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(PathBuf::from(DEFAULT_LOG_DIR)));

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 设置日志目录（来自配置）。
 */
pub fn set_log_dir(dir: &Path) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.to_path_buf();
    }
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn format_line(timestamp: &str, level: &str, category: &str, message: &str) -> String {
    format!("{} [{}] {} - {}", timestamp, level, category, message)
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = LOG_DIR
        .read()
        .map(|g| g.clone())
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    writeln!(file, "{}", format_line(&timestamp, level, category, message))?;
    Ok(())
}
