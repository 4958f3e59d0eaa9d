//! 任务管理器：生命周期状态机的唯一写入方
//!
//! - 同一任务 id 的读-改-写由该 id 的 `tokio::sync::Mutex` 串行化，不同 id 并行
//! - Active 计数用 `AtomicUsize` 在写入 Active 之前 CAS 预留名额，写入失败则归还，终态写入成功后扣减
//! - 每次成功迁移都以 AuditEntry 写入长期记忆；审计写入失败只记日志，不撤销迁移
//! - 批量提交期间已插入的任务登记在 staged 中，整批成功前对查询、调度与迁移不可见

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;

use crate::core::AgentError;
use crate::memory::{MemoryEntry, MemoryManager};
use crate::tasks::governance::{ApprovalDecision, Governance, TicketId};
use crate::tasks::model::metrics_eligible;
use crate::tasks::{AuditEntry, Metric, Task, TaskId, TaskSettings, TaskStatus, TaskStore};
use crate::tools::ToolCatalog;

/// 重启时仍为 Active 的任务的失败原因
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Pending → Active 被推迟的原因（任务保持 Pending，下一轮调度再试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Active 数已达 max_concurrent
    Saturated,
    /// 审批尚未决定
    AwaitingApproval,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Task),
    Deferred(DeferReason),
    /// 审批被拒，任务已转为 Failed
    Rejected(Task),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub created_by: Option<String>,
    pub requires_approval: Option<bool>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = Some(requires_approval);
        self
    }

    fn matches(&self, task: &Task) -> bool {
        self.statuses.as_ref().map_or(true, |s| s.contains(&task.status))
            && self.created_by.as_ref().map_or(true, |c| &task.created_by == c)
            && self.requires_approval.map_or(true, |r| task.requires_approval == r)
    }
}

/// 一轮调度的结果
#[derive(Debug, Clone, Default)]
pub struct SchedulePass {
    pub activated: Vec<Task>,
    pub expired: Vec<TaskId>,
    pub rejected: Vec<TaskId>,
    pub deferred: Vec<TaskId>,
}

pub struct TaskManager {
    store: TaskStore,
    governance: Arc<Governance>,
    memory: Arc<MemoryManager>,
    catalog: Arc<ToolCatalog>,
    settings: TaskSettings,
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
    staged: Mutex<HashSet<TaskId>>,
    active: AtomicUsize,
}

impl TaskManager {
    pub fn new(
        store: TaskStore,
        governance: Arc<Governance>,
        memory: Arc<MemoryManager>,
        catalog: Arc<ToolCatalog>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            store,
            governance,
            memory,
            catalog,
            settings,
            locks: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    pub fn governance(&self) -> &Arc<Governance> {
        &self.governance
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 启动时恢复：上次进程留下的 Active 任务没有执行方再回报，转为 Failed 并释放名额；
    /// 待审批任务重新开票（票据只在内存中）。返回被中断的任务数
    pub async fn restore(&self) -> Result<usize, AgentError> {
        let tasks = self.store.list().await?;
        let orphaned: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Active)
            .map(|t| t.id.clone())
            .collect();
        self.active.store(orphaned.len(), Ordering::SeqCst);

        let mut interrupted = 0;
        for id in &orphaned {
            match self.report_failure(id, INTERRUPTED_REASON).await {
                Ok(TransitionOutcome::Applied(_)) => interrupted += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, task = %id, "interrupted task not released"),
            }
        }

        for task in tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && t.requires_approval)
        {
            let _guard = self.lock_task(&task.id).await;
            if let Err(e) = self.reopen_ticket(task).await {
                tracing::warn!(error = %e, "failed to reopen approval ticket");
            }
        }
        tracing::info!(interrupted, active = self.active_count(), "task manager restored");
        Ok(interrupted)
    }

    /// 校验后以 Pending 持久化；需要审批时开票
    pub async fn add_task(&self, task: Task) -> Result<Task, AgentError> {
        let task = self.prepare(task)?;
        let task = self.open_ticket_if_needed(task);
        if let Err(e) = self.store.add(&task).await {
            self.close_ticket(&task);
            return Err(e);
        }
        tracing::info!(task = %task.id, name = %task.name, priority = task.priority, requires_approval = task.requires_approval, "task added");
        self.audit(&task.id, None, TaskStatus::Pending, "created").await;
        Ok(task)
    }

    /// 全部校验通过后逐条插入；任一插入失败则删除本次已插入的记录（全有或全无）
    pub async fn add_batch(&self, tasks: Vec<Task>) -> Result<Vec<Task>, AgentError> {
        let prepared = tasks
            .into_iter()
            .map(|t| self.prepare(t))
            .collect::<Result<Vec<_>, _>>()?;
        let prepared: Vec<Task> = prepared
            .into_iter()
            .map(|t| self.open_ticket_if_needed(t))
            .collect();

        self.stage(&prepared);
        let mut inserted: Vec<&Task> = Vec::with_capacity(prepared.len());
        for task in &prepared {
            if let Err(e) = self.store.add(task).await {
                tracing::warn!(error = %e, task = %task.id, inserted = inserted.len(), "batch insert failed, rolling back");
                for done in &inserted {
                    self.roll_back(done).await;
                }
                for t in &prepared {
                    self.close_ticket(t);
                }
                self.unstage(&prepared);
                return Err(e);
            }
            inserted.push(task);
        }
        self.unstage(&prepared);

        for task in &prepared {
            self.audit(&task.id, None, TaskStatus::Pending, "created").await;
        }
        tracing::info!(count = prepared.len(), "task batch added");
        Ok(prepared)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, AgentError> {
        self.ensure_visible(id)?;
        self.store.get(id).await
    }

    /// 按 priority 降序、created_at 升序
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, AgentError> {
        let mut tasks: Vec<Task> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t) && !self.is_staged(&t.id))
            .collect();
        tasks.sort_by(Task::schedule_order);
        Ok(tasks)
    }

    /// 按迁移表更新任务；id、created_at、created_by、requires_approval 与审批票据以存储为准
    pub async fn update_task(&self, task: Task) -> Result<TransitionOutcome, AgentError> {
        let _guard = self.lock_task(&task.id).await;
        self.ensure_visible(&task.id)?;
        let current = self.store.get(&task.id).await?;
        let next = Task {
            id: current.id.clone(),
            created_at: current.created_at,
            created_by: current.created_by.clone(),
            requires_approval: current.requires_approval,
            approval_ticket: current.approval_ticket,
            ..task
        };
        self.apply(current, next, "updated").await
    }

    /// 只改状态的迁移
    pub async fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        reason: &str,
    ) -> Result<TransitionOutcome, AgentError> {
        let _guard = self.lock_task(id).await;
        self.ensure_visible(id)?;
        let current = self.store.get(id).await?;
        let mut next = current.clone();
        next.status = to;
        self.apply(current, next, reason).await
    }

    pub async fn report_completion(&self, id: &str) -> Result<TransitionOutcome, AgentError> {
        self.transition(id, TaskStatus::Completed, "execution completed").await
    }

    /// Active → Failed，并把失败原因写入长期记忆
    pub async fn report_failure(&self, id: &str, reason: &str) -> Result<TransitionOutcome, AgentError> {
        let outcome = self.transition(id, TaskStatus::Failed, reason).await?;
        if let TransitionOutcome::Applied(task) = &outcome {
            self.commit_failure(task, reason).await;
        }
        Ok(outcome)
    }

    /// Pending → Failed：被重新考虑的计划取代；只适用于尚未激活的任务
    pub async fn supersede(&self, id: &str, reason: &str) -> Result<TransitionOutcome, AgentError> {
        let _guard = self.lock_task(id).await;
        self.ensure_visible(id)?;
        let current = self.store.get(id).await?;
        if current.status != TaskStatus::Pending {
            return Err(AgentError::InvalidTransition {
                from: current.status,
                to: TaskStatus::Failed,
            });
        }
        let mut next = current.clone();
        next.status = TaskStatus::Failed;
        self.apply(current, next, &format!("superseded: {reason}")).await
    }

    /// 以任务 id 投票（查找其审批票据）
    pub async fn vote(
        &self,
        id: &str,
        stakeholder: &str,
        weight: f64,
        approve: bool,
    ) -> Result<ApprovalDecision, AgentError> {
        let task = self.get_task(id).await?;
        let ticket = task
            .approval_ticket
            .ok_or_else(|| AgentError::NotFound(format!("approval ticket for task {id}")))?;
        self.governance.record_vote(ticket, stakeholder, weight, approve)?;
        self.governance.resolve(ticket)
    }

    pub fn suggestion_eligible(&self, metrics: &BTreeMap<String, Metric>) -> bool {
        self.settings.auto_suggest && metrics_eligible(metrics, self.settings.suggest_threshold)
    }

    /// 一轮调度：先处理过期，再按 priority / created_at 顺序尝试激活 Pending 任务
    pub async fn schedule_pass(&self) -> Result<SchedulePass, AgentError> {
        let now = Utc::now();
        let mut pass = SchedulePass::default();
        let tasks = self.list_tasks(&TaskFilter::all()).await?;

        for task in tasks.iter().filter(|t| !t.status.is_terminal() && t.is_overdue(now)) {
            let reason = match task.status {
                TaskStatus::Active => "deadline elapsed",
                _ => "deadline elapsed before activation",
            };
            match self.transition(&task.id, TaskStatus::Failed, reason).await {
                Ok(TransitionOutcome::Applied(failed)) => {
                    self.commit_failure(&failed, reason).await;
                    pass.expired.push(failed.id);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, task = %task.id, "expiry skipped"),
            }
        }

        for task in tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && !t.is_overdue(now))
        {
            match self.transition(&task.id, TaskStatus::Active, "scheduled").await {
                Ok(TransitionOutcome::Applied(active)) => pass.activated.push(active),
                Ok(TransitionOutcome::Rejected(failed)) => pass.rejected.push(failed.id),
                Ok(TransitionOutcome::Deferred(_)) => pass.deferred.push(task.id.clone()),
                // 并发迁移后状态已变，下一轮再看
                Err(AgentError::InvalidTransition { .. }) => {}
                Err(e) => tracing::warn!(error = %e, task = %task.id, "activation skipped"),
            }
        }

        if !(pass.activated.is_empty() && pass.expired.is_empty() && pass.rejected.is_empty()) {
            tracing::info!(
                activated = pass.activated.len(),
                expired = pass.expired.len(),
                rejected = pass.rejected.len(),
                deferred = pass.deferred.len(),
                active = self.active_count(),
                "schedule pass"
            );
        }
        Ok(pass)
    }

    fn prepare(&self, mut task: Task) -> Result<Task, AgentError> {
        task.validate(Some(&self.catalog))?;
        task.status = TaskStatus::Pending;
        task.approval_ticket = None;
        task.updated_at = task.created_at;
        // 涉及需要审批的工具 / 动作时强制审批
        let gated_tool = self
            .catalog
            .descriptors()
            .any(|d| d.requires_approval && task.tools.contains(&d.tool));
        let gated_action = task.actions.iter().any(|a| {
            self.catalog
                .find_action(&a.action_type, &a.name)
                .is_some_and(|d| d.requires_approval)
        });
        if gated_tool || gated_action {
            task.requires_approval = true;
        }
        Ok(task)
    }

    fn open_ticket_if_needed(&self, mut task: Task) -> Task {
        if task.requires_approval {
            task.approval_ticket = Some(self.governance.request_approval(&task));
        }
        task
    }

    fn close_ticket(&self, task: &Task) {
        if let Some(ticket) = task.approval_ticket {
            self.governance.withdraw(ticket);
        }
    }

    /// 持有该 id 锁时调用
    async fn reopen_ticket(&self, mut task: Task) -> Result<TicketId, AgentError> {
        let ticket = self.governance.request_approval(&task);
        task.approval_ticket = Some(ticket);
        task.updated_at = Utc::now().max(task.created_at);
        self.store.update(&task).await?;
        Ok(ticket)
    }

    async fn apply(
        &self,
        current: Task,
        mut next: Task,
        reason: &str,
    ) -> Result<TransitionOutcome, AgentError> {
        let from = current.status;
        let to = next.status;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition { from, to });
        }
        next.validate(Some(&self.catalog))?;
        next.updated_at = Utc::now().max(current.updated_at);

        if from == TaskStatus::Pending && to == TaskStatus::Active {
            return self.activate(current, next, reason).await;
        }

        self.store.update(&next).await?;
        if from == TaskStatus::Active {
            self.release_slot();
        }
        if to.is_terminal() {
            self.close_ticket(&next);
            self.forget_lock(&next.id);
        }
        tracing::info!(task = %next.id, %from, %to, reason, "task transition");
        self.audit(&next.id, Some(from), to, reason).await;
        Ok(TransitionOutcome::Applied(next))
    }

    async fn activate(
        &self,
        current: Task,
        next: Task,
        reason: &str,
    ) -> Result<TransitionOutcome, AgentError> {
        if next.is_overdue(Utc::now()) {
            return Err(AgentError::Validation(format!(
                "task {} deadline elapsed before activation",
                next.id
            )));
        }

        if current.requires_approval {
            let decision = match current.approval_ticket {
                Some(ticket) => match self.governance.resolve(ticket) {
                    Err(AgentError::NotFound(_)) => None,
                    other => Some(other?),
                },
                None => None,
            };
            match decision {
                Some(ApprovalDecision::Approved) => {}
                Some(ApprovalDecision::Pending) => {
                    return Ok(TransitionOutcome::Deferred(DeferReason::AwaitingApproval));
                }
                Some(ApprovalDecision::Rejected) => {
                    let mut failed = current;
                    failed.status = TaskStatus::Failed;
                    failed.updated_at = next.updated_at;
                    self.store.update(&failed).await?;
                    self.close_ticket(&failed);
                    self.forget_lock(&failed.id);
                    tracing::info!(task = %failed.id, "approval rejected, task failed");
                    self.audit(&failed.id, Some(TaskStatus::Pending), TaskStatus::Failed, "approval rejected")
                        .await;
                    return Ok(TransitionOutcome::Rejected(failed));
                }
                None => {
                    let ticket = self.reopen_ticket(current).await?;
                    tracing::info!(task = %next.id, ticket = %ticket, "approval ticket reopened");
                    return Ok(TransitionOutcome::Deferred(DeferReason::AwaitingApproval));
                }
            }
        }

        if !self.try_reserve_slot() {
            tracing::debug!(task = %next.id, max = self.settings.max_concurrent, "activation deferred, concurrency bound reached");
            return Ok(TransitionOutcome::Deferred(DeferReason::Saturated));
        }
        if let Err(e) = self.store.update(&next).await {
            self.release_slot();
            return Err(e);
        }
        self.close_ticket(&next);
        tracing::info!(task = %next.id, from = %TaskStatus::Pending, to = %TaskStatus::Active, reason, active = self.active_count(), "task transition");
        self.audit(&next.id, Some(TaskStatus::Pending), TaskStatus::Active, reason)
            .await;
        Ok(TransitionOutcome::Applied(next))
    }

    fn try_reserve_slot(&self) -> bool {
        let max = self.settings.max_concurrent;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn stage(&self, tasks: &[Task]) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.extend(tasks.iter().map(|t| t.id.clone()));
    }

    fn unstage(&self, tasks: &[Task]) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        for t in tasks {
            staged.remove(&t.id);
        }
    }

    fn is_staged(&self, id: &str) -> bool {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// 整批提交前的任务按不存在处理
    fn ensure_visible(&self, id: &str) -> Result<(), AgentError> {
        if self.is_staged(id) {
            return Err(AgentError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// 删除本批次已插入的记录；只删仍为 Pending 的，否则保留并记错误
    async fn roll_back(&self, task: &Task) {
        let _guard = self.lock_task(&task.id).await;
        match self.store.get(&task.id).await {
            Ok(stored) if stored.status != TaskStatus::Pending => {
                tracing::error!(task = %task.id, status = %stored.status, "batch rollback skipped, task already left Pending");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, task = %task.id, "batch rollback lookup failed");
                return;
            }
        }
        if let Err(e) = self.store.remove(&task.id).await {
            tracing::error!(error = %e, task = %task.id, "batch rollback failed");
        }
        self.forget_lock(&task.id);
    }

    async fn lock_task(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// 终态任务不会再迁移，释放其锁条目
    fn forget_lock(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    async fn audit(&self, task_id: &str, from: Option<TaskStatus>, to: TaskStatus, reason: &str) {
        let entry = AuditEntry::new(task_id, from, to, reason).into_memory_entry();
        if let Err(e) = self.memory.commit(entry).await {
            tracing::warn!(error = %e, task = task_id, %to, "audit write failed");
        }
    }

    async fn commit_failure(&self, task: &Task, reason: &str) {
        let entry = MemoryEntry::new(
            "task_failure",
            json!({
                "task_id": task.id,
                "name": task.name,
                "reason": reason,
                "steps": task.execution_steps,
            }),
        )
        .with_importance(0.8)
        .with_tag("failure")
        .with_tag(format!("task:{}", task.id));
        if let Err(e) = self.memory.commit(entry).await {
            tracing::warn!(error = %e, task = %task.id, "failure record not persisted");
        }
    }
}
