//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete（非流式）。
//! 超时与重试由调用方负责：RetryingLlmClient 在瞬时错误时做一次有界退避后重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("api error: {0}")]
    Api(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// 超时、网络、限流属于瞬时错误，可重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::Network(_) | LlmError::RateLimited { .. }
        )
    }
}

/// LLM 客户端 trait：complete(messages) -> text
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略：瞬时错误最多重试一次，退避时间有上限
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// 计算本次退避时长：限流时参考 retry_after，但不超过 max_backoff
    fn delay_for(&self, err: &LlmError) -> Duration {
        let base = match err {
            LlmError::RateLimited { retry_after_ms } => {
                Duration::from_millis(*retry_after_ms).max(self.backoff)
            }
            _ => self.backoff,
        };
        base.min(self.max_backoff)
    }
}

/// 包装任意 LlmClient：瞬时错误时退避一次后重试，仍失败则原样返回
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self.inner.complete(messages).await {
            Err(err) if err.is_transient() => {
                let delay = self.config.delay_for(&err);
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "LLM call failed, retrying once");
                tokio::time::sleep(delay).await;
                self.inner.complete(messages).await
            }
            other => other,
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retry_once_on_transient_error() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Timeout);
        mock.push_reply("ok");
        let client = RetryingLlmClient::new(mock.clone(), fast_retry());

        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_second_retry() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Network("reset".into()));
        mock.push_error(LlmError::Network("reset".into()));
        mock.push_reply("never reached");
        let client = RetryingLlmClient::new(mock.clone(), fast_retry());

        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Network(_)));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Api("invalid key".into()));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry());

        assert!(client.complete(&[Message::user("hi")]).await.is_err());
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn test_rate_limit_delay_is_capped() {
        let cfg = RetryConfig {
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        let delay = cfg.delay_for(&LlmError::RateLimited {
            retry_after_ms: 60_000,
        });
        assert_eq!(delay, Duration::from_secs(1));
    }
}
