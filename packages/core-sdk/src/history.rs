use serde::{Deserialize, Serialize};

use crate::models::Message;

/** \brief 持久化历史的最大条数。 */
pub const HISTORY_LIMIT: usize = 50;

/**
 * \brief 有界对话历史，按插入顺序保存（最旧在前）。
 * \details 追加后超过上限时从头部丢弃，仅保留最近 HISTORY_LIMIT 条。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    entries: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 由已有条目构造；不做截断，原样保留存储中的内容。
     */
    pub fn from_entries(entries: Vec<Message>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /**
     * \brief 追加一轮完整对话（先 user 后 model），随后截断到上限。
     */
    pub fn push_turn(&mut self, user: impl Into<String>, model: impl Into<String>) {
        self.entries.push(Message::user(user));
        self.entries.push(Message::model(model));
        self.truncate_to_limit();
    }

    fn truncate_to_limit(&mut self) {
        if self.entries.len() > HISTORY_LIMIT {
            let overflow = self.entries.len() - HISTORY_LIMIT;
            self.entries.drain(..overflow);
        }
    }
}
