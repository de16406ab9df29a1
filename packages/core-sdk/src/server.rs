use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    db::{self, SharedConnection},
    llm::GenerativeApi,
    models::{Message, TurnId},
    protocol::{PanelEvent, PanelRequest},
    router::MessageRouter,
    settings::{KeyVisibility, SettingsPanel, Status},
    telemetry,
};

/**
 * \brief 服务共享状态：一个路由实例 + 设置页所需的连接与 API。
 */
#[derive(Clone)]
pub struct AppState {
    router: MessageRouter,
    conn: SharedConnection,
    api: Arc<dyn GenerativeApi>,
}

impl AppState {
    pub fn new(conn: SharedConnection, api: Arc<dyn GenerativeApi>) -> Self {
        Self {
            router: MessageRouter::new(conn.clone(), api.clone()),
            conn,
            api,
        }
    }

    fn settings(&self) -> SettingsPanel {
        SettingsPanel::new(self.conn.clone(), self.api.clone())
    }
}

/**
 * \brief 构建路由表。
 */
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/panel", post(panel_request))
        .route("/api/chat", post(chat_turn))
        .route("/api/events", get(events_sse))
        .route("/api/history", get(get_history))
        .route(
            "/api/settings/key",
            get(get_key).put(save_key).delete(clear_key),
        )
        .route("/api/health", get(health_check))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，对外提供后台路由。
 * \param addr 监听地址，如 "127.0.0.1:5174"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Router listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening on {}", addr));
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    /** \brief 用户消息 */
    message: String,
    /** \brief 调用方指定的轮次 ID（可选） */
    #[serde(default)]
    turn_id: Option<TurnId>,
}

#[derive(Serialize, Debug)]
struct HistoryResponse {
    messages: Vec<Message>,
    has_api_key: bool,
}

#[derive(Deserialize, Debug)]
struct KeyQuery {
    #[serde(default)]
    reveal: bool,
}

#[derive(Serialize, Debug)]
struct KeyResponse {
    api_key: Option<String>,
    visibility_icon: &'static str,
    toggle_title: &'static str,
}

#[derive(Deserialize, Debug)]
struct SaveKeyRequest {
    api_key: String,
}

/**
 * \brief 面板协议入口：SEND_MESSAGE 后台执行并通过 /api/events 推送结果。
 */
async fn panel_request(
    State(state): State<AppState>,
    Json(request): Json<PanelRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    match request {
        PanelRequest::SendMessage { turn_id, message } => {
            if message.trim().is_empty() {
                return Err(bad_request("message must not be empty"));
            }
            let router = state.router.clone();
            tokio::spawn(async move {
                router.submit(turn_id, &message).await;
            });
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "turn_id": turn_id })),
            ))
        }
        PanelRequest::ClearChat => {
            state.router.clear().map_err(internal_err)?;
            Ok((StatusCode::OK, Json(serde_json::json!({"ok": true}))))
        }
    }
}

/**
 * \brief 同步执行一轮对话并直接返回对应事件。
 */
async fn chat_turn(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<PanelEvent>, (StatusCode, String)> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let turn_id = request.turn_id.unwrap_or_default();
    let outcome = state.router.submit(turn_id, message).await;
    Ok(Json(outcome.event()))
}

/**
 * \brief 推送事件 SSE 流：GET /api/events
 */
async fn events_sse(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state.router.events().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        let name = match &event {
            PanelEvent::StreamUpdate { .. } => "stream_update",
            PanelEvent::Error { .. } => "error",
        };
        Ok::<Event, Infallible>(Event::default().event(name).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new())
}

async fn get_history(
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, (StatusCode, String)> {
    let history = state.router.history().map_err(internal_err)?;
    let has_api_key = state.router.has_credential().map_err(internal_err)?;
    Ok(Json(HistoryResponse {
        messages: history.entries().to_vec(),
        has_api_key,
    }))
}

/**
 * \brief 读取已保存密钥；默认遮挡显示。
 */
async fn get_key(
    State(state): State<AppState>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<KeyResponse>, (StatusCode, String)> {
    let visibility = if q.reveal {
        KeyVisibility::Plain
    } else {
        KeyVisibility::Obscured
    };
    let stored = state.settings().load().map_err(internal_err)?;
    Ok(Json(KeyResponse {
        api_key: stored.map(|k| visibility.render(&k)),
        visibility_icon: visibility.icon(),
        toggle_title: visibility.toggle_title(),
    }))
}

async fn save_key(
    State(state): State<AppState>,
    Json(payload): Json<SaveKeyRequest>,
) -> (StatusCode, Json<Status>) {
    let status = state.settings().save(&payload.api_key).await;
    status_response(status)
}

async fn clear_key(State(state): State<AppState>) -> (StatusCode, Json<Status>) {
    status_response(state.settings().clear())
}

/**
 * \brief 健康检查：报告存储是否可读与密钥是否已配置。
 */
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    match db::with_conn(&state.conn, db::get_api_key) {
        Ok(key) => Json(serde_json::json!({
            "ok": true,
            "has_api_key": key.is_some(),
            "session": {
                "active_turn": state.router.session().snapshot().active_turn,
                "completed_turns": state.router.session().snapshot().completed_turns,
            }
        })),
        Err(e) => Json(serde_json::json!({
            "ok": false,
            "error": e.to_string()
        })),
    }
}

fn status_response(status: Status) -> (StatusCode, Json<Status>) {
    let code = if status.is_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

fn bad_request(message: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
