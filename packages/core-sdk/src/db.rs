use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::history::ConversationHistory;

/** \brief 存储键：API Key。 */
pub const API_KEY: &str = "apiKey";
/** \brief 存储键：对话历史（JSON 数组）。 */
pub const CHAT_HISTORY_KEY: &str = "chatHistory";
/** \brief 存储键：遥测开关。 */
pub const TELEMETRY_KEY: &str = "telemetryEnabled";

/**
 * \brief 跨组件共享的连接；锁只在同步读写期间持有，不跨 await。
 */
pub type SharedConnection = Arc<Mutex<Connection>>;

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open database {} failed", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 打开数据库并完成迁移，包装为共享连接。
 */
pub fn open_shared(path: &Path) -> Result<SharedConnection> {
    let conn = open_db(path)?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/**
 * \brief 在共享连接上执行一次同步操作。
 */
pub fn with_conn<T, F>(shared: &SharedConnection, action: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    let guard = shared
        .lock()
        .map_err(|_| anyhow!("database connection lock poisoned"))?;
    action(&guard)
}

/**
 * \brief 运行数据库迁移，创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取键值，不存在时返回 None。
 */
pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM kv_store WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 写入键值（存在则覆盖）。
 */
pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除键值；键不存在时为空操作。
 */
pub fn remove_value(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM kv_store WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 读取 API Key。
 */
pub fn get_api_key(conn: &Connection) -> Result<Option<String>> {
    Ok(get_value(conn, API_KEY)?.filter(|k| !k.is_empty()))
}

pub fn set_api_key(conn: &Connection, api_key: &str) -> Result<()> {
    set_value(conn, API_KEY, api_key)
}

pub fn remove_api_key(conn: &Connection) -> Result<()> {
    remove_value(conn, API_KEY)
}

/**
 * \brief 读取对话历史；未保存过时返回空历史。
 */
pub fn load_history(conn: &Connection) -> Result<ConversationHistory> {
    match get_value(conn, CHAT_HISTORY_KEY)? {
        Some(raw) => serde_json::from_str(&raw).context("decode chat history failed"),
        None => Ok(ConversationHistory::new()),
    }
}

/**
 * \brief 覆盖写入对话历史。
 */
pub fn save_history(conn: &Connection, history: &ConversationHistory) -> Result<()> {
    let raw = serde_json::to_string(history)?;
    set_value(conn, CHAT_HISTORY_KEY, &raw)
}

/**
 * \brief 删除对话历史条目（幂等）。
 */
pub fn remove_history(conn: &Connection) -> Result<()> {
    remove_value(conn, CHAT_HISTORY_KEY)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    let val = get_value(conn, TELEMETRY_KEY)?;
    Ok(val.map(|s| s == "1").unwrap_or(false))
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_value(conn, TELEMETRY_KEY, if enabled { "1" } else { "0" })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最多尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn mem_shared() -> SharedConnection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    migrate(&conn).expect("migrate");
    Arc::new(Mutex::new(conn))
}
