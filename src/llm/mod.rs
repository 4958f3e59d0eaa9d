//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 重试包装 / 嵌入）

pub mod embedding;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端：openai（带一次重试）或 mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "mock" => Arc::new(MockLlmClient::new()),
        provider => {
            if provider != "openai" {
                tracing::warn!(provider, "unknown LLM provider, falling back to openai-compatible client");
            }
            let inner: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                cfg.api_key.as_deref(),
                Duration::from_secs(cfg.timeouts.request),
            ));
            let retry = RetryConfig {
                backoff: Duration::from_millis(cfg.retry_backoff_ms),
                ..RetryConfig::default()
            };
            Arc::new(RetryingLlmClient::new(inner, retry))
        }
    }
}
