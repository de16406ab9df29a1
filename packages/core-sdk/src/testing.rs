use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;

use crate::error::{ChatError, ChatResult};
use crate::llm::{Content, GenerativeApi};

/**
 * \brief 记录调用次数与最近请求的假生成服务。
 */
pub(crate) struct FakeApi {
    reply: Mutex<ChatResult<String>>,
    probe: Mutex<ChatResult<()>>,
    pub generate_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub last_contents: Mutex<Vec<Content>>,
}

impl FakeApi {
    pub fn replying(text: &str) -> Self {
        Self::with_reply(Ok(text.to_string()))
    }

    pub fn with_reply(reply: ChatResult<String>) -> Self {
        Self {
            reply: Mutex::new(reply),
            probe: Mutex::new(Ok(())),
            generate_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            last_contents: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reply(&self, reply: ChatResult<String>) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn rejecting_probe(self) -> Self {
        *self.probe.lock().unwrap() = Err(ChatError::ValidationFailure("400".into()));
        self
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeApi for FakeApi {
    async fn generate_content(&self, _api_key: &str, contents: &[Content]) -> ChatResult<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_contents.lock().unwrap() = contents.to_vec();
        self.reply.lock().unwrap().clone()
    }

    async fn probe_key(&self, _api_key: &str) -> ChatResult<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.lock().unwrap().clone()
    }
}
