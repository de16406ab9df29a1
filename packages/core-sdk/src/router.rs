use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::broadcast;

use crate::db::{self, SharedConnection};
use crate::error::{ChatError, ChatResult};
use crate::history::ConversationHistory;
use crate::llm::{self, GenerativeApi};
use crate::models::TurnId;
use crate::protocol::{PanelEvent, PanelRequest};
use crate::telemetry;

const EVENT_CAPACITY: usize = 64;

/**
 * \brief 路由会话状态快照。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /** \brief 正在处理的轮次；空闲时为 None */
    pub active_turn: Option<TurnId>,
    /** \brief 自上次清空以来成功完成的轮次数 */
    pub completed_turns: u64,
}

/**
 * \brief 路由侧的会话对象，生命周期与 MessageRouter 句柄绑定。
 */
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().map(|g| *g).unwrap_or_default()
    }

    fn begin(&self, turn_id: TurnId) {
        if let Ok(mut guard) = self.state.lock() {
            guard.active_turn = Some(turn_id);
        }
    }

    fn finish(&self, turn_id: TurnId, succeeded: bool) {
        if let Ok(mut guard) = self.state.lock() {
            if guard.active_turn == Some(turn_id) {
                guard.active_turn = None;
            }
            if succeeded {
                guard.completed_turns += 1;
            }
        }
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = SessionState::default();
        }
    }
}

/**
 * \brief 单轮结果：调用方直接拿到的关联结果，同时也会以事件形式广播。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub result: ChatResult<String>,
}

impl TurnOutcome {
    /**
     * \brief 转为推送事件；错误只携带用户可读文本。
     */
    pub fn event(&self) -> PanelEvent {
        match &self.result {
            Ok(text) => PanelEvent::StreamUpdate {
                turn_id: self.turn_id,
                content: text.clone(),
                done: true,
            },
            Err(err) => PanelEvent::Error {
                turn_id: self.turn_id,
                content: err.user_message().to_string(),
            },
        }
    }
}

/**
 * \brief 后台消息路由：编排一轮对话并维护持久化历史。
 */
#[derive(Clone)]
pub struct MessageRouter {
    conn: SharedConnection,
    api: Arc<dyn GenerativeApi>,
    session: Arc<Session>,
    events: broadcast::Sender<PanelEvent>,
}

impl MessageRouter {
    pub fn new(conn: SharedConnection, api: Arc<dyn GenerativeApi>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conn,
            api,
            session: Arc::new(Session::default()),
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /**
     * \brief 订阅推送事件（只收到订阅之后发出的事件）。
     */
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    /**
     * \brief 以 Stream 形式订阅事件；落后过多时跳过丢失的事件继续接收。
     */
    pub fn events(&self) -> impl Stream<Item = PanelEvent> + Send + 'static {
        let mut rx = self.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        telemetry::log_error(
                            "router.events",
                            &format!("subscriber lagged, skipped={}", skipped),
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /**
     * \brief 分发面板请求。
     */
    pub async fn handle(&self, request: PanelRequest) -> Option<TurnOutcome> {
        match request {
            PanelRequest::SendMessage { turn_id, message } => {
                Some(self.submit(turn_id, &message).await)
            }
            PanelRequest::ClearChat => {
                if let Err(e) = self.clear() {
                    telemetry::log_error("router.clear", &format!("clear failed: {}", e));
                }
                None
            }
        }
    }

    /**
     * \brief 处理一条用户消息；结果返回给调用方并广播给所有面板。
     */
    pub async fn submit(&self, turn_id: TurnId, message: &str) -> TurnOutcome {
        self.session.begin(turn_id);
        let result = self.run_turn(message).await;
        self.session.finish(turn_id, result.is_ok());

        match &result {
            Ok(text) => telemetry::log_event(
                "router.turn",
                &format!(
                    "turn={} prompt_len={} reply_len={}",
                    turn_id,
                    message.len(),
                    text.len()
                ),
            ),
            Err(e) => telemetry::log_error("router.turn", &format!("turn={} failed: {}", turn_id, e)),
        }

        let outcome = TurnOutcome { turn_id, result };
        // 无订阅者时 send 返回 Err，可忽略
        let _ = self.events.send(outcome.event());
        outcome
    }

    async fn run_turn(&self, message: &str) -> ChatResult<String> {
        let api_key =
            db::with_conn(&self.conn, db::get_api_key)?.ok_or(ChatError::MissingCredential)?;
        let mut history = db::with_conn(&self.conn, db::load_history)?;

        let contents = llm::build_contents(history.entries(), message);
        let text = self.api.generate_content(&api_key, &contents).await?;

        history.push_turn(message, text.clone());
        db::with_conn(&self.conn, |conn| db::save_history(conn, &history))?;
        Ok(text)
    }

    /**
     * \brief 清空会话与持久化历史，幂等。
     */
    pub fn clear(&self) -> ChatResult<()> {
        self.session.reset();
        db::with_conn(&self.conn, db::remove_history)?;
        telemetry::log_event("router.clear", "history cleared");
        Ok(())
    }

    /**
     * \brief 读取当前持久化历史（面板初始加载用）。
     */
    pub fn history(&self) -> ChatResult<ConversationHistory> {
        Ok(db::with_conn(&self.conn, db::load_history)?)
    }

    /**
     * \brief 是否已保存 API Key。
     */
    pub fn has_credential(&self) -> ChatResult<bool> {
        Ok(db::with_conn(&self.conn, db::get_api_key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MISSING_KEY_MESSAGE;
    use crate::history::HISTORY_LIMIT;
    use crate::models::{Message, Role};
    use crate::testing::FakeApi;
    use futures_util::StreamExt;

    fn router_with(api: Arc<FakeApi>, api_key: Option<&str>) -> (MessageRouter, SharedConnection) {
        let conn = db::mem_shared();
        if let Some(key) = api_key {
            db::with_conn(&conn, |c| db::set_api_key(c, key)).expect("set key");
        }
        (MessageRouter::new(conn.clone(), api), conn)
    }

    fn stored_history(conn: &SharedConnection) -> ConversationHistory {
        db::with_conn(conn, db::load_history).expect("load history")
    }

    #[tokio::test]
    async fn test_missing_key_never_calls_api() {
        let api = Arc::new(FakeApi::replying("unused"));
        let (router, conn) = router_with(api.clone(), None);
        let mut rx = router.subscribe();

        let turn_id = TurnId::new();
        let outcome = router.submit(turn_id, "hello").await;

        assert_eq!(outcome.result, Err(ChatError::MissingCredential));
        assert_eq!(api.generate_count(), 0);
        assert_eq!(
            rx.try_recv().expect("error event"),
            PanelEvent::Error {
                turn_id,
                content: MISSING_KEY_MESSAGE.to_string()
            }
        );
        assert!(stored_history(&conn).is_empty());
    }

    #[tokio::test]
    async fn test_successful_turn_appends_two_entries() {
        let api = Arc::new(FakeApi::replying("Hello there"));
        let (router, conn) = router_with(api.clone(), Some("AIzaTest"));
        let mut rx = router.subscribe();

        let turn_id = TurnId::new();
        let outcome = router.submit(turn_id, "hi").await;
        assert_eq!(outcome.result.as_deref(), Ok("Hello there"));

        let history = stored_history(&conn);
        assert_eq!(
            history.entries(),
            &[Message::user("hi"), Message::model("Hello there")]
        );
        assert_eq!(
            rx.try_recv().expect("update event"),
            PanelEvent::StreamUpdate {
                turn_id,
                content: "Hello there".into(),
                done: true
            }
        );
        assert_eq!(router.session().snapshot().completed_turns, 1);
        assert_eq!(router.session().snapshot().active_turn, None);
    }

    #[tokio::test]
    async fn test_history_is_persisted_before_completion_event() {
        let api = Arc::new(FakeApi::replying("answer"));
        let (router, conn) = router_with(api, Some("AIzaTest"));
        let mut rx = router.subscribe();

        let observer = tokio::spawn(async move {
            let event = rx.recv().await.expect("event");
            let len = db::with_conn(&conn, db::load_history).expect("load").len();
            (event, len)
        });
        router.submit(TurnId::new(), "question").await;

        let (event, len_at_event) = observer.await.expect("observer");
        assert!(matches!(event, PanelEvent::StreamUpdate { done: true, .. }));
        assert_eq!(len_at_event, 2);
    }

    #[tokio::test]
    async fn test_outbound_payload_includes_history_in_order() {
        let api = Arc::new(FakeApi::replying("good"));
        let (router, conn) = router_with(api.clone(), Some("AIzaTest"));
        let mut seed = ConversationHistory::new();
        seed.push_turn("hi", "hello");
        db::with_conn(&conn, |c| db::save_history(c, &seed)).expect("seed");

        router.submit(TurnId::new(), "how are you?").await;

        let contents = api.last_contents.lock().unwrap().clone();
        assert_eq!(contents.len(), 3);
        let roles: Vec<&str> = contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(contents[0].parts[0].text, "hi");
        assert_eq!(contents[1].parts[0].text, "hello");
        assert_eq!(contents[2].parts[0].text, "how are you?");
    }

    #[tokio::test]
    async fn test_failures_leave_history_untouched() {
        let api = Arc::new(FakeApi::with_reply(Err(ChatError::MalformedResponse)));
        let (router, conn) = router_with(api.clone(), Some("AIzaTest"));
        let mut seed = ConversationHistory::new();
        seed.push_turn("hi", "hello");
        db::with_conn(&conn, |c| db::save_history(c, &seed)).expect("seed");
        let mut rx = router.subscribe();

        let outcome = router.submit(TurnId::new(), "again").await;
        assert_eq!(outcome.result, Err(ChatError::MalformedResponse));
        assert!(matches!(rx.try_recv(), Ok(PanelEvent::Error { .. })));
        assert_eq!(stored_history(&conn), seed);

        api.set_reply(Err(ChatError::TransportFailure("503".into())));
        let outcome = router.submit(TurnId::new(), "again").await;
        assert!(matches!(outcome.result, Err(ChatError::TransportFailure(_))));
        assert_eq!(stored_history(&conn), seed);
        assert_eq!(router.session().snapshot().completed_turns, 0);
    }

    #[tokio::test]
    async fn test_history_window_keeps_latest_entries() {
        let api = Arc::new(FakeApi::replying("latest answer"));
        let (router, conn) = router_with(api, Some("AIzaTest"));
        let mut seed = ConversationHistory::new();
        for i in 0..(HISTORY_LIMIT / 2) {
            seed.push_turn(format!("q{}", i), format!("a{}", i));
        }
        assert_eq!(seed.len(), HISTORY_LIMIT);
        db::with_conn(&conn, |c| db::save_history(c, &seed)).expect("seed");

        router.submit(TurnId::new(), "latest question").await;

        let history = stored_history(&conn);
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.entries()[0], Message::user("q1"));
        assert_eq!(history.entries()[HISTORY_LIMIT - 2], Message::user("latest question"));
        assert_eq!(history.entries()[HISTORY_LIMIT - 1].role, Role::Model);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent_and_resets_session() {
        let api = Arc::new(FakeApi::replying("ok"));
        let (router, conn) = router_with(api.clone(), Some("AIzaTest"));
        router.submit(TurnId::new(), "hi").await;
        assert_eq!(router.session().snapshot().completed_turns, 1);

        router.clear().expect("first clear");
        let once = db::with_conn(&conn, |c| db::get_value(c, db::CHAT_HISTORY_KEY)).expect("get");
        router.clear().expect("second clear");
        let twice = db::with_conn(&conn, |c| db::get_value(c, db::CHAT_HISTORY_KEY)).expect("get");

        assert_eq!(once, None);
        assert_eq!(once, twice);
        assert_eq!(router.session().snapshot(), SessionState::default());
        assert_eq!(api.generate_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_dispatches_requests() {
        let api = Arc::new(FakeApi::replying("pong"));
        let (router, conn) = router_with(api, Some("AIzaTest"));
        let turn_id = TurnId::new();

        let outcome = router
            .handle(PanelRequest::SendMessage {
                turn_id,
                message: "ping".into(),
            })
            .await
            .expect("send yields outcome");
        assert_eq!(outcome.turn_id, turn_id);
        assert_eq!(stored_history(&conn).len(), 2);

        assert!(router.handle(PanelRequest::ClearChat).await.is_none());
        assert!(stored_history(&conn).is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_carries_turn_ids() {
        let api = Arc::new(FakeApi::replying("one"));
        let (router, _conn) = router_with(api, Some("AIzaTest"));
        let events = router.events();
        tokio::pin!(events);

        let first = TurnId::new();
        let second = TurnId::new();
        router.submit(first, "a").await;
        router.submit(second, "b").await;

        let got: Vec<TurnId> = vec![
            events.next().await.expect("first").turn_id(),
            events.next().await.expect("second").turn_id(),
        ];
        assert_eq!(got, vec![first, second]);
    }
}
