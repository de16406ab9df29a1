use serde::{Deserialize, Serialize};

use crate::models::TurnId;

/**
 * \brief 面板发往路由的请求。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanelRequest {
    SendMessage { turn_id: TurnId, message: String },
    ClearChat,
}

/**
 * \brief 路由广播给面板的事件，均携带轮次标识。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanelEvent {
    StreamUpdate {
        turn_id: TurnId,
        content: String,
        done: bool,
    },
    Error {
        turn_id: TurnId,
        content: String,
    },
}

impl PanelEvent {
    pub fn turn_id(&self) -> TurnId {
        match self {
            PanelEvent::StreamUpdate { turn_id, .. } | PanelEvent::Error { turn_id, .. } => {
                *turn_id
            }
        }
    }
}
