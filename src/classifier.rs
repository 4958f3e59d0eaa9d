//! 消息分类器
//!
//! 对每条入站消息调用一次 LLM，得到意图 / 实体 / 情绪 / 置信度、是否回复、是否需要生成动作及动作种子。
//! 模型输出无法解析时按 fail-safe 处理（不回复、不生成动作），只记 warn，不重试。

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::deliberation::parse::{extract_json, split_reasoning};
use crate::deliberation::ActionSeed;
use crate::llm::{LlmClient, Message};
use crate::memory::{MemoryEntry, MemoryManager, MemoryQuery};
use crate::tools::ToolCatalog;

/// 消息意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Question,
    Feedback,
    Complaint,
    Suggestion,
    Greeting,
    Inquiry,
    Request,
    Acknowledge,
    #[default]
    #[serde(other)]
    Unknown,
}

/// 消息涉及的实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Person,
    Product,
    Company,
    Location,
    Datetime,
    Crypto,
    Wallet,
    Contract,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Positive,
    Negative,
    #[default]
    #[serde(other)]
    Neutral,
}

/// null 或缺失时取默认值
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default, deserialize_with = "lenient")]
    pub intent: Intent,
    #[serde(default, deserialize_with = "lenient")]
    pub entity: Entity,
    #[serde(default, deserialize_with = "lenient")]
    pub emotion: Emotion,
    #[serde(default, deserialize_with = "lenient")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub should_reply: bool,
    #[serde(default, alias = "response_msg")]
    pub reply: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub should_generate_action: bool,
    #[serde(default, alias = "actions", deserialize_with = "lenient")]
    pub action_seeds: Vec<ActionSeed>,
}

impl Classification {
    /// 不回复、不生成动作
    pub fn fail_safe() -> Self {
        Self::default()
    }

    /// 置信度限制在 [0, 1]；不回复时清空回复；不生成动作时清空种子；丢弃未注册工具的种子
    fn normalize(mut self, catalog: &ToolCatalog) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self.reply = self
            .reply
            .take()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if !self.should_reply {
            self.reply = None;
        }
        if self.reply.is_none() {
            self.should_reply = false;
        }
        if !self.should_generate_action {
            self.action_seeds.clear();
        }
        let before = self.action_seeds.len();
        self.action_seeds
            .retain(|s| catalog.find_action(&s.action_type, &s.action_name).is_some());
        if self.action_seeds.len() < before {
            tracing::warn!(dropped = before - self.action_seeds.len(), "action seeds with unknown tools dropped");
        }
        self
    }
}

const CLASSIFIER_INSTRUCTIONS: &str = r#"Classify the incoming message and decide how to respond.
Reply with JSON only:
{"intent": "question|feedback|complaint|suggestion|greeting|inquiry|request|acknowledge",
 "entity": "person|product|company|location|datetime|crypto|wallet|contract",
 "emotion": "positive|negative|neutral",
 "confidence": 0.0-1.0,
 "should_reply": bool,
 "reply": "text of the reply when should_reply is true",
 "should_generate_action": bool,
 "action_seeds": [{"action_type": "tool", "action_name": "action"}]}
Set should_generate_action to true only when the message requires new tasks or actions; seeds must use the available tools."#;

pub struct MessageClassifier {
    llm: Arc<dyn LlmClient>,
    memory: Arc<MemoryManager>,
    catalog: Arc<ToolCatalog>,
    system_prompt: String,
    history_len: usize,
    context_limit: usize,
}

impl MessageClassifier {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        memory: Arc<MemoryManager>,
        catalog: Arc<ToolCatalog>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            memory,
            catalog,
            system_prompt: system_prompt.into(),
            history_len: 10,
            context_limit: 5,
        }
    }

    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// 分类一条消息；LLM 调用失败返回 Err，输出不可解析返回 fail-safe 分类
    pub async fn classify(
        &self,
        sender: &str,
        text: &str,
        extra_context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Classification, AgentError> {
        let history = self.memory.get_recent(self.history_len);
        let related = self
            .memory
            .fetch_context(&MemoryQuery::new().with_text(text).with_limit(self.context_limit))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "memory context unavailable for classification");
                Vec::new()
            });

        let messages = vec![
            Message::system(format!("{}\n\n{}", self.system_prompt, CLASSIFIER_INSTRUCTIONS)),
            Message::user(self.render(sender, text, &history, &related, extra_context)),
        ];

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.llm.complete(&messages) => r?,
        };

        let classification = match parse_classification(&reply) {
            Ok(c) => c.normalize(&self.catalog),
            Err(e) => {
                tracing::warn!(error = %e, sender, "classification error, falling back to fail-safe");
                Classification::fail_safe()
            }
        };
        tracing::info!(
            sender,
            intent = ?classification.intent,
            confidence = classification.confidence,
            should_reply = classification.should_reply,
            should_generate_action = classification.should_generate_action,
            seeds = classification.action_seeds.len(),
            "message classified"
        );
        Ok(classification)
    }

    fn render(
        &self,
        sender: &str,
        text: &str,
        history: &[MemoryEntry],
        related: &[MemoryEntry],
        extra_context: Option<&str>,
    ) -> String {
        let mut s = String::new();
        s.push_str(&format!("## Recent history\n{}\n\n", MemoryManager::render_context(history)));
        s.push_str(&format!("## Relevant memory\n{}\n\n", MemoryManager::render_context(related)));
        if let Some(extra) = extra_context.filter(|e| !e.trim().is_empty()) {
            s.push_str(&format!("## External context\n{}\n\n", extra.trim()));
        }
        s.push_str(&format!("## Available tools\n{}\n\n", self.catalog.prompt_section()));
        s.push_str(&format!("## Message from {sender}\n{text}"));
        s
    }
}

fn parse_classification(reply: &str) -> Result<Classification, String> {
    let (body, _) = split_reasoning(reply);
    let json = extract_json(&body).ok_or_else(|| "no JSON found in reply".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid classification: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::NoopLongTerm;
    use crate::tools::ToolDescriptor;

    fn classifier(mock: Arc<MockLlmClient>) -> MessageClassifier {
        let catalog = Arc::new(ToolCatalog::new().with(ToolDescriptor::new("twitter", "post_tweet", "Post")));
        let memory = Arc::new(MemoryManager::new(8, Arc::new(NoopLongTerm)));
        MessageClassifier::new(mock, memory, catalog, "You are a helpful agent.")
    }

    #[tokio::test]
    async fn test_classify_parses_and_normalizes() {
        let mock = Arc::new(MockLlmClient::with_replies([r#"{"intent":"request","entity":"crypto","emotion":"positive",
            "confidence":1.7,"should_reply":true,"response_msg":"On it!","should_generate_action":true,
            "actions":[{"action_type":"twitter","action_name":"post_tweet"},{"action_type":"discord","action_name":"post"}]}"#]));
        let c = classifier(Arc::clone(&mock))
            .classify("alice", "please tweet the news", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(c.intent, Intent::Request);
        assert_eq!(c.entity, Entity::Crypto);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.reply.as_deref(), Some("On it!"));
        assert_eq!(c.action_seeds.len(), 1);
        assert!(mock.prompt(0).unwrap().contains("## Message from alice"));
    }

    #[tokio::test]
    async fn test_unknown_labels_and_nulls_are_tolerated() {
        let mock = Arc::new(MockLlmClient::with_replies([
            r#"{"intent":"banter","entity":null,"emotion":"ecstatic","confidence":0.4,"should_reply":false}"#,
        ]));
        let c = classifier(mock)
            .classify("bob", "lol", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(c.intent, Intent::Unknown);
        assert_eq!(c.entity, Entity::Unknown);
        assert_eq!(c.emotion, Emotion::Neutral);
        assert!(!c.should_generate_action);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_fail_safe() {
        let mock = Arc::new(MockLlmClient::with_replies(["I think you should reply kindly."]));
        let c = classifier(Arc::clone(&mock))
            .classify("bob", "hi", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(c, Classification::fail_safe());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_llm_error_is_returned() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::Api("bad key".into()));
        let err = classifier(mock)
            .classify("bob", "hi", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmError(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_reply() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = classifier(Arc::new(MockLlmClient::new()))
            .classify("bob", "hi", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
