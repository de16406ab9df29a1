use time::{macros::format_description, OffsetDateTime};

use crate::error::MISSING_KEY_MESSAGE;
use crate::format::{tokenize, Span};
use crate::history::ConversationHistory;
use crate::models::{Role, TurnId};
use crate::protocol::{PanelEvent, PanelRequest};

/**
 * \brief 渲染条目的作者。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    User,
    Model,
    Error,
}

impl From<Role> for Author {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Author::User,
            Role::Model => Author::Model,
        }
    }
}

/**
 * \brief 面板上的一条已渲染消息；时间戳仅用于显示，不会持久化。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEntry {
    pub author: Author,
    pub content: String,
    pub rendered_at: OffsetDateTime,
}

impl RenderedEntry {
    fn now(author: Author, content: impl Into<String>) -> Self {
        Self {
            author,
            content: content.into(),
            rendered_at: local_now(),
        }
    }

    /**
     * \brief 渲染片段：只有模型回复会解析标记，用户与错误内容一律按字面文本。
     */
    pub fn spans(&self) -> Vec<Span<'_>> {
        match self.author {
            Author::Model => tokenize(&self.content).collect(),
            Author::User | Author::Error => vec![Span::Text {
                text: &self.content,
            }],
        }
    }

    /** \brief HH:MM:SS */
    pub fn timestamp(&self) -> String {
        self.rendered_at
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default()
    }
}

/** \brief 本地时间；无法确定本地时区时退回 UTC。 */
fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelState {
    #[default]
    Idle,
    Sending {
        turn_id: TurnId,
    },
}

/**
 * \brief `begin_send` 的结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAttempt {
    /** \brief 空输入或已有请求在途，忽略 */
    Ignored,
    /** \brief 本地检查未发现密钥，已渲染提示 */
    MissingCredential,
    /** \brief 需要交给路由的请求 */
    Send(PanelRequest),
}

/**
 * \brief 聊天面板：单会话 UI 状态机 Idle → Sending → Idle。
 */
#[derive(Debug, Default)]
pub struct ChatPanel {
    state: PanelState,
    transcript: Vec<RenderedEntry>,
    typing: bool,
    input_enabled: bool,
    input_focused: bool,
}

impl ChatPanel {
    pub fn new() -> Self {
        Self {
            input_enabled: true,
            ..Default::default()
        }
    }

    /**
     * \brief 初始加载：按存储顺序渲染历史；未配置密钥时追加一次提示。
     */
    pub fn load(&mut self, history: &ConversationHistory, has_credential: bool) {
        self.transcript.extend(
            history
                .entries()
                .iter()
                .map(|m| RenderedEntry::now(m.role.into(), m.content.clone())),
        );
        if !has_credential {
            self.push(Author::Error, MISSING_KEY_MESSAGE);
        }
    }

    /**
     * \brief 用户触发发送。
     */
    pub fn begin_send(&mut self, input: &str, has_credential: bool) -> SendAttempt {
        let message = input.trim();
        if message.is_empty() || self.is_sending() {
            return SendAttempt::Ignored;
        }
        if !has_credential {
            self.push(Author::Error, MISSING_KEY_MESSAGE);
            return SendAttempt::MissingCredential;
        }

        let turn_id = TurnId::new();
        self.state = PanelState::Sending { turn_id };
        self.input_enabled = false;
        self.input_focused = false;
        self.push(Author::User, message);
        self.typing = true;
        SendAttempt::Send(PanelRequest::SendMessage {
            turn_id,
            message: message.to_string(),
        })
    }

    /**
     * \brief 处理路由推送；非当前在途轮次的事件被忽略，返回是否已应用。
     */
    pub fn apply(&mut self, event: &PanelEvent) -> bool {
        let in_flight = match self.state {
            PanelState::Sending { turn_id } => turn_id,
            PanelState::Idle => return false,
        };
        if event.turn_id() != in_flight {
            return false;
        }

        self.typing = false;
        match event {
            PanelEvent::StreamUpdate { content, done, .. } => {
                let last_is_model = self
                    .transcript
                    .last()
                    .is_some_and(|last| last.author == Author::Model);
                if last_is_model {
                    if let Some(last) = self.transcript.last_mut() {
                        last.content = content.clone();
                    }
                } else {
                    self.push(Author::Model, content.clone());
                }
                if *done {
                    self.finish();
                    self.input_focused = true;
                }
            }
            PanelEvent::Error { content, .. } => {
                self.push(Author::Error, content.clone());
                self.finish();
            }
        }
        true
    }

    /**
     * \brief 清空会话，需用户确认；确认后返回交给路由的请求。
     */
    pub fn request_clear(&mut self, confirmed: bool) -> Option<PanelRequest> {
        if !confirmed {
            return None;
        }
        self.transcript.clear();
        self.typing = false;
        self.finish();
        Some(PanelRequest::ClearChat)
    }

    fn finish(&mut self) {
        self.state = PanelState::Idle;
        self.input_enabled = true;
    }

    fn push(&mut self, author: Author, content: impl Into<String>) {
        self.transcript.push(RenderedEntry::now(author, content));
    }

    pub fn state(&self) -> PanelState {
        self.state
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.state, PanelState::Sending { .. })
    }

    pub fn transcript(&self) -> &[RenderedEntry] {
        &self.transcript
    }

    pub fn typing_indicator(&self) -> bool {
        self.typing
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    pub fn input_focused(&self) -> bool {
        self.input_focused
    }
}
