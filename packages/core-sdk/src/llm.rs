use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{normalize_api_base, Config};
use crate::error::{ChatError, ChatResult};
use crate::models::Message;

/**
 * \brief `contents[]` 中的单条内容。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: &'a [Content],
}

/**
 * \brief 远端生成服务的抽象；路由与设置页只依赖该接口。
 */
#[async_trait]
pub trait GenerativeApi: Send + Sync {
    /** \brief 发送完整对话内容，返回生成文本。 */
    async fn generate_content(&self, api_key: &str, contents: &[Content]) -> ChatResult<String>;

    /** \brief 用模型列表接口探测密钥是否可用，只关心状态码。 */
    async fn probe_key(&self, api_key: &str) -> ChatResult<()>;
}

/**
 * \brief 由历史与新消息构造请求内容：历史按序在前，新消息作为最后一条 user。
 */
pub fn build_contents(history: &[Message], message: &str) -> Vec<Content> {
    history
        .iter()
        .map(|m| Content {
            role: m.role.api_label().to_string(),
            parts: vec![Part {
                text: m.content.clone(),
            }],
        })
        .chain(std::iter::once(Content {
            role: "user".to_string(),
            parts: vec![Part {
                text: message.to_string(),
            }],
        }))
        .collect()
}

/**
 * \brief 提取首个候选的全部文本分片；结构不符时返回 MalformedResponse。
 */
pub fn extract_generated_text(v: &Value) -> ChatResult<String> {
    let parts = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or(ChatError::MalformedResponse)?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        return Err(ChatError::MalformedResponse);
    }
    Ok(texts.concat())
}

/**
 * \brief 基于 reqwest 的 Gemini 客户端，密钥通过 `key` 查询参数传递。
 */
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_base: &str, model: &str) -> Self {
        Self {
            api_base: normalize_api_base(api_base),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_base, &config.model)
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.api_base)
    }
}

#[async_trait]
impl GenerativeApi for GeminiClient {
    async fn generate_content(&self, api_key: &str, contents: &[Content]) -> ChatResult<String> {
        let resp = self
            .client
            .post(self.generate_url())
            .query(&[("key", api_key)])
            .json(&GenerateRequest { contents })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ChatError::TransportFailure(format!(
                "gemini request failed: {} -> {}",
                status, text
            )));
        }
        let v: Value = resp.json().await?;
        extract_generated_text(&v)
    }

    async fn probe_key(&self, api_key: &str) -> ChatResult<()> {
        let resp = self
            .client
            .get(self.models_url())
            .query(&[("key", api_key)])
            .send()
            .await
            .map_err(|e| ChatError::ValidationFailure(e.without_url().to_string()))?;
        if !resp.status().is_success() {
            return Err(ChatError::ValidationFailure(format!(
                "list models returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
