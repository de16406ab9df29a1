use thiserror::Error;

/** \brief 未配置密钥时展示给用户的固定提示。 */
pub const MISSING_KEY_MESSAGE: &str = "Please set your API key in the settings to start chatting.";

/** \brief 发送失败时展示给用户的通用提示。 */
pub const SEND_FAILED_MESSAGE: &str =
    "Sorry, I couldn't get a response. Please check your API key and try again.";

/**
 * \brief 聊天链路的错误分类，均在组件边界处被处理并转为用户可读文本。
 */
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// 本地未保存 API Key
    #[error("API key is not set")]
    MissingCredential,

    /// 远端返回非成功状态或网络失败
    #[error("send failed: {0}")]
    TransportFailure(String),

    /// 响应缺少 candidates[0].content.parts[].text
    #[error("invalid response format")]
    MalformedResponse,

    /// 设置页密钥校验失败（格式或探活）
    #[error("API key validation failed: {0}")]
    ValidationFailure(String),

    /// 本地存储读写失败
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    /**
     * \brief 面向用户的提示文本；除缺少密钥外均使用通用提示，不暴露内部细节。
     */
    pub fn user_message(&self) -> &'static str {
        match self {
            ChatError::MissingCredential => MISSING_KEY_MESSAGE,
            _ => SEND_FAILED_MESSAGE,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::MalformedResponse
        } else {
            // 请求 URL 带有 key 查询参数，不能进入错误文本
            ChatError::TransportFailure(err.without_url().to_string())
        }
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_details() {
        assert_eq!(
            ChatError::MissingCredential.user_message(),
            MISSING_KEY_MESSAGE
        );
        let err = ChatError::TransportFailure("500 Internal Server Error".into());
        assert_eq!(err.user_message(), SEND_FAILED_MESSAGE);
        assert_eq!(ChatError::MalformedResponse.user_message(), SEND_FAILED_MESSAGE);
    }
}
