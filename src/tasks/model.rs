//! 任务数据模型：Task / Action / TaskStatus / Metric / TaskSettings / AuditEntry

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::AgentError;
use crate::memory::MemoryEntry;
use crate::tasks::governance::TicketId;
use crate::tools::ToolCatalog;

pub type TaskId = String;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// 迁移表：Pending→Active、Active→Completed、Active→Failed、Pending→Failed；其余（含自迁移）非法
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Active)
                | (TaskStatus::Active, TaskStatus::Completed)
                | (TaskStatus::Active, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 绑定到工具的具体动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub task_id: TaskId,
}

impl Action {
    /// (action_type, name) 必须对应目录中的一个 ToolDescriptor
    pub fn validate(&self, catalog: &ToolCatalog) -> Result<(), AgentError> {
        if self.action_type.trim().is_empty() || self.name.trim().is_empty() {
            return Err(AgentError::Validation(
                "action type and name must not be empty".into(),
            ));
        }
        if catalog.find_action(&self.action_type, &self.name).is_none() {
            return Err(AgentError::Validation(format!(
                "unknown action {}.{}",
                self.action_type, self.name
            )));
        }
        Ok(())
    }
}

/// 自主建议的触发指标：current >= threshold 时触发
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub threshold: f64,
    pub current: f64,
}

impl Metric {
    pub fn fires(&self) -> bool {
        self.current >= self.threshold
    }
}

/// 触发比例 >= suggest_threshold 时可自主建议任务；空集合永不满足
pub fn metrics_eligible(metrics: &BTreeMap<String, Metric>, suggest_threshold: f64) -> bool {
    if metrics.is_empty() {
        return false;
    }
    let fired = metrics.values().filter(|m| m.fires()).count();
    fired as f64 / metrics.len() as f64 >= suggest_threshold
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSettings {
    #[serde(default)]
    pub auto_suggest: bool,
    #[serde(default = "default_suggest_threshold")]
    pub suggest_threshold: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_min_approval")]
    pub min_stakeholder_approval: f64,
}

fn default_suggest_threshold() -> f64 {
    0.5
}

fn default_max_concurrent() -> usize {
    3
}

fn default_min_approval() -> f64 {
    0.5
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            auto_suggest: false,
            suggest_threshold: default_suggest_threshold(),
            max_concurrent: default_max_concurrent(),
            min_stakeholder_approval: default_min_approval(),
        }
    }
}

impl TaskSettings {
    pub fn approval_threshold(&self) -> f64 {
        if self.min_stakeholder_approval.is_nan() {
            return default_min_approval();
        }
        self.min_stakeholder_approval.clamp(0.0, 1.0)
    }
}

/// 任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub execution_steps: Vec<String>,
    #[serde(default)]
    pub priority: f64,
    pub status: TaskStatus,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub requires_stakeholder_input: bool,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub approval_ticket: Option<TicketId>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Metric>,
}

impl Task {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            execution_steps: Vec::new(),
            priority: 0.0,
            status: TaskStatus::Pending,
            deadline: None,
            requires_approval: false,
            requires_stakeholder_input: false,
            tools: Vec::new(),
            created_by: String::new(),
            created_at: now,
            updated_at: now,
            actions: Vec::new(),
            approval_ticket: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.execution_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// 提交前校验；catalog 为 None 或为空时不校验工具引用
    pub fn validate(&self, catalog: Option<&ToolCatalog>) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Validation("task name must not be empty".into()));
        }
        if self.execution_steps.is_empty() {
            return Err(AgentError::Validation(format!(
                "task '{}' has no execution steps",
                self.name
            )));
        }
        if self.execution_steps.iter().any(|s| s.trim().is_empty()) {
            return Err(AgentError::Validation(format!(
                "task '{}' has an empty execution step",
                self.name
            )));
        }
        if !self.priority.is_finite() {
            return Err(AgentError::Validation(format!(
                "task '{}' priority must be finite",
                self.name
            )));
        }
        if self.updated_at < self.created_at {
            return Err(AgentError::Validation(format!(
                "task '{}' updated_at precedes created_at",
                self.name
            )));
        }
        if self.tools.iter().any(|t| t.trim().is_empty()) {
            return Err(AgentError::Validation(format!(
                "task '{}' has an empty tool reference",
                self.name
            )));
        }
        if let Some(catalog) = catalog.filter(|c| !c.is_empty()) {
            if let Some(unknown) = self.tools.iter().find(|t| !catalog.contains_tool(t)) {
                return Err(AgentError::Validation(format!(
                    "task '{}' references unknown tool '{}'",
                    self.name, unknown
                )));
            }
            for action in &self.actions {
                action.validate(catalog)?;
            }
        }
        Ok(())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// 调度顺序：priority 降序，其次 created_at 升序
    pub fn schedule_order(a: &Task, b: &Task) -> Ordering {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    }
}

/// 状态迁移审计记录，镜像到长期记忆
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub task_id: TaskId,
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(task_id: &str, from: Option<TaskStatus>, to: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn into_memory_entry(self) -> MemoryEntry {
        let importance = if self.to.is_terminal() { 0.6 } else { 0.3 };
        let task_tag = format!("task:{}", self.task_id);
        let content = serde_json::json!({
            "task_id": self.task_id,
            "from": self.from,
            "to": self.to,
            "reason": self.reason,
        });
        MemoryEntry::new("task_transition", content)
            .with_timestamp(self.timestamp)
            .with_importance(importance)
            .with_tag("audit")
            .with_tag(task_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDescriptor;
    use chrono::Duration;

    #[test]
    fn test_transition_table_exhaustive() {
        let allowed = [
            (TaskStatus::Pending, TaskStatus::Active),
            (TaskStatus::Active, TaskStatus::Completed),
            (TaskStatus::Active, TaskStatus::Failed),
            (TaskStatus::Pending, TaskStatus::Failed),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_validate_required_fields() {
        assert!(Task::new("", "d").with_steps(["x"]).validate(None).is_err());
        assert!(Task::new("n", "d").validate(None).is_err());
        assert!(Task::new("n", "d")
            .with_steps(["x"])
            .with_priority(f64::INFINITY)
            .validate(None)
            .is_err());
        assert!(Task::new("n", "d").with_steps(["notify"]).validate(None).is_ok());
    }

    #[test]
    fn test_validate_tool_references() {
        let catalog = ToolCatalog::new().with(ToolDescriptor::new("twitter", "post_tweet", ""));
        let ok = Task::new("n", "d").with_steps(["post"]).with_tools(["twitter"]);
        assert!(ok.validate(Some(&catalog)).is_ok());
        let bad = Task::new("n", "d").with_steps(["post"]).with_tools(["discord"]);
        assert!(bad.validate(Some(&catalog)).is_err());
        assert!(bad.validate(None).is_ok());
    }

    #[test]
    fn test_schedule_order() {
        let t0 = Utc::now();
        let low = Task::new("low", "").with_priority(1.0).with_created_at(t0);
        let high_late = Task::new("hl", "")
            .with_priority(2.0)
            .with_created_at(t0 + Duration::seconds(5));
        let high_early = Task::new("he", "").with_priority(2.0).with_created_at(t0);
        let mut tasks = vec![low, high_late, high_early];
        tasks.sort_by(Task::schedule_order);
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["he", "hl", "low"]);
    }

    #[test]
    fn test_metrics_eligibility() {
        let mut metrics = BTreeMap::new();
        assert!(!metrics_eligible(&metrics, 0.0));
        metrics.insert("volume".into(), Metric { threshold: 10.0, current: 12.0 });
        metrics.insert("holders".into(), Metric { threshold: 100.0, current: 50.0 });
        assert!(metrics_eligible(&metrics, 0.5));
        assert!(!metrics_eligible(&metrics, 0.75));
    }

    #[test]
    fn test_audit_entry_tags() {
        let entry = AuditEntry::new("t1", Some(TaskStatus::Pending), TaskStatus::Active, "scheduled")
            .into_memory_entry();
        assert_eq!(entry.kind, "task_transition");
        assert!(entry.tags.contains("audit"));
        assert!(entry.tags.contains("task:t1"));
    }
}
