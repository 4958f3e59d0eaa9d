//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按脚本顺序返回预设回复或错误；脚本耗尽后回显最后一条 User 消息。
//! 同时记录每次调用收到的消息，便于断言「每阶段恰好一次调用」。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    received: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以一组预设回复创建
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for reply in replies {
            mock.push_reply(reply);
        }
        mock
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(err));
    }

    /// 已发生的调用次数
    pub fn calls(&self) -> usize {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 第 i 次调用的 user prompt
    pub fn prompt(&self, i: usize) -> Option<String> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(i)
            .and_then(|msgs| msgs.iter().rev().find(|m| m.role == Role::User))
            .map(|m| m.content.clone())
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(result) => result,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Echo from Mock: {last_user}"))
            }
        }
    }
}
