//! Agent 运行时：一条消息的完整回合、自主建议、调度执行回报
//!
//! 回合流程：外部上下文 → 分类 → （需要时）动作审议 → 承载任务入库。
//! 审议批次失败（欠量 / 定稿失败）只记日志，不影响本轮回复；取消与存储错误向上返回。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::character::Character;
use crate::classifier::{Classification, MessageClassifier};
use crate::config::SuggestSection;
use crate::core::AgentError;
use crate::datasource::{self, DataSource};
use crate::deliberation::{DeliberationPipeline, DeliberationRequest};
use crate::memory::{MemoryEntry, MemoryManager};
use crate::tasks::{Metric, SchedulePass, Task, TaskId, TaskManager, TaskStatus, TransitionOutcome};

/// 自主建议任务的 created_by
pub const SELF_REQUESTER: &str = "self";

/// 入站消息（外层渠道的格式不在本 crate 范围内）
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: String,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub classification: Classification,
    pub reply: Option<String>,
    /// 本轮审议出的承载任务（已入库，Pending）
    pub planned_task: Option<Task>,
}

/// 一轮 tick 的结果
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub pass: SchedulePass,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

/// 执行已激活的任务；返回 Err 时任务进入 Failed，错误文本作为失败原因
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<(), AgentError>;
}

/// 只记录日志的执行器（未接入外部工具时使用）
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl TaskExecutor for LoggingExecutor {
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Result<(), AgentError> {
        tracing::info!(task = %task.id, name = %task.name, steps = task.execution_steps.len(), "executing task");
        for action in &task.actions {
            tracing::info!(
                task = %task.id,
                tool = %action.action_type,
                action = %action.name,
                parameters = %serde_json::Value::Object(action.parameters.clone()),
                "action dispatched"
            );
        }
        Ok(())
    }
}

/// 构建 Agent 所需的全部组件
pub struct AgentParts {
    pub character: Character,
    pub memory: Arc<MemoryManager>,
    pub tasks: Arc<TaskManager>,
    pub pipeline: Arc<DeliberationPipeline>,
    pub classifier: MessageClassifier,
    pub data_source: Arc<dyn DataSource>,
    pub data_token: Option<String>,
    pub suggest: SuggestSection,
    pub executor: Arc<dyn TaskExecutor>,
}

pub struct Agent {
    character: Character,
    memory: Arc<MemoryManager>,
    tasks: Arc<TaskManager>,
    pipeline: Arc<DeliberationPipeline>,
    classifier: MessageClassifier,
    data_source: Arc<dyn DataSource>,
    data_token: Option<String>,
    suggest: SuggestSection,
    executor: Arc<dyn TaskExecutor>,
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        Self {
            character: parts.character,
            memory: parts.memory,
            tasks: parts.tasks,
            pipeline: parts.pipeline,
            classifier: parts.classifier,
            data_source: parts.data_source,
            data_token: parts.data_token,
            suggest: parts.suggest,
            executor: parts.executor,
        }
    }

    pub fn character(&self) -> &Character {
        &self.character
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn pipeline(&self) -> &Arc<DeliberationPipeline> {
        &self.pipeline
    }

    /// 启动时恢复工作记忆快照与任务状态
    pub async fn restore(&self) -> Result<(), AgentError> {
        let entries = self.memory.restore_working().await?;
        let interrupted = self.tasks.restore().await?;
        tracing::info!(entries, interrupted, "agent restored");
        Ok(())
    }

    /// 处理一条入站消息
    pub async fn handle_message(
        &self,
        msg: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let extra =
            datasource::message_context(self.data_source.as_ref(), self.data_token.as_deref(), &msg.text).await;

        let classification = match self
            .classifier
            .classify(&msg.sender, &msg.text, extra.as_deref(), cancel)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.remember(message_entry(&msg, None)).await;
                return Err(e);
            }
        };
        self.remember(message_entry(&msg, Some(&classification))).await;

        let reply = classification.reply.clone();
        if let Some(text) = &reply {
            let entry = MemoryEntry::new("reply", json!({ "to": msg.sender, "text": text }))
                .with_tag("conversation")
                .with_tag(format!("sender:{}", msg.sender));
            self.remember(entry).await;
        }

        let planned_task = if classification.should_generate_action {
            let req = DeliberationRequest::actions(
                msg.text.clone(),
                msg.sender.clone(),
                classification.action_seeds.clone(),
            )
            .with_extra_context(extra);
            match self.pipeline.plan_actions(&req, cancel).await {
                Ok(task) => task,
                Err(e) if e.is_batch_abort() => {
                    tracing::warn!(error = %e, sender = %msg.sender, "action planning aborted, turn continues");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(TurnOutcome {
            classification,
            reply,
            planned_task,
        })
    }

    /// 指标满足阈值时自主审议一批任务
    pub async fn self_suggest(&self, cancel: &CancellationToken) -> Result<Vec<Task>, AgentError> {
        if !self.tasks.settings().auto_suggest {
            return Ok(Vec::new());
        }
        let metrics = self.current_metrics().await;
        if !self.tasks.suggestion_eligible(&metrics) {
            tracing::debug!(metrics = metrics.len(), "self-suggestion not eligible");
            return Ok(Vec::new());
        }

        let objective = self
            .suggest
            .objective
            .clone()
            .or_else(|| self.character.goal_objective())
            .unwrap_or_else(|| format!("Advance the goals of {} with the available tools", self.character.name));
        let context = metrics
            .iter()
            .map(|(name, m)| format!("{name}: current {} (threshold {})", m.current, m.threshold))
            .collect::<Vec<_>>()
            .join("\n");
        let req = DeliberationRequest::tasks(objective, SELF_REQUESTER)
            .with_extra_context(Some(context))
            .with_metrics(metrics);

        match self.pipeline.plan_tasks(&req, cancel).await {
            Ok(tasks) => {
                tracing::info!(count = tasks.len(), "self-suggested tasks added");
                Ok(tasks)
            }
            Err(e) if e.is_batch_abort() => {
                tracing::warn!(error = %e, "self-suggestion aborted");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 一轮调度：过期 / 激活 Pending 任务，执行新激活的任务并回报结果
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, AgentError> {
        let pass = self.tasks.schedule_pass().await?;
        let runs = pass.activated.iter().map(|task| async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                r = self.executor.execute(task, cancel) => r,
            };
            (task.id.clone(), result)
        });
        let results = join_all(runs).await;

        let mut report = TickReport {
            pass,
            ..TickReport::default()
        };
        for (id, result) in results {
            let outcome = match result {
                Ok(()) => self.tasks.report_completion(&id).await,
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "task execution failed");
                    self.tasks.report_failure(&id, &e.to_string()).await
                }
            };
            match outcome {
                Ok(TransitionOutcome::Applied(task)) if task.status == TaskStatus::Completed => {
                    report.completed.push(task.id)
                }
                Ok(TransitionOutcome::Applied(task)) => report.failed.push(task.id),
                Ok(_) => {}
                Err(e) => tracing::warn!(task = %id, error = %e, "execution report not applied"),
            }
        }
        Ok(report)
    }

    async fn current_metrics(&self) -> BTreeMap<String, Metric> {
        let Some(token) = self.data_token.as_deref().filter(|t| !t.is_empty()) else {
            return BTreeMap::new();
        };
        if self.suggest.thresholds.is_empty() || !self.data_source.enabled() {
            return BTreeMap::new();
        }
        match self.data_source.get_metrics(token).await {
            Ok(values) => self
                .suggest
                .thresholds
                .iter()
                .filter_map(|(name, threshold)| {
                    values.values.get(name).map(|current| {
                        (
                            name.clone(),
                            Metric {
                                threshold: *threshold,
                                current: *current,
                            },
                        )
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, token, "metrics unavailable, self-suggestion skipped");
                BTreeMap::new()
            }
        }
    }

    /// 记忆写入失败不影响回合
    async fn remember(&self, entry: MemoryEntry) {
        if let Err(e) = self.memory.remember(entry).await {
            tracing::warn!(error = %e, "memory write failed");
        }
    }
}

fn message_entry(msg: &IncomingMessage, classification: Option<&Classification>) -> MemoryEntry {
    let mut entry = MemoryEntry::new("message", json!({ "sender": msg.sender, "text": msg.text }))
        .with_tag("conversation")
        .with_tag(format!("sender:{}", msg.sender));
    if let Some(c) = classification {
        entry = entry
            .with_metadata("intent", json!(c.intent))
            .with_metadata("emotion", json!(c.emotion))
            .with_metadata("confidence", json!(c.confidence));
    }
    entry
}
