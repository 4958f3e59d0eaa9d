//! 审议流水线：Generate → Evaluate → Reconsider → Refine → Finalize
//!
//! 每个阶段对整批候选恰好调用一次 LLM（Generate 欠量时重新提示一次，Finalize 失败时重试一次）。
//! 所有 LLM 与记忆调用都与调用方的 CancellationToken 竞争；取消或失败时不向任务存储写入任何东西。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::deliberation::parse::{
    detect_reconsideration, parse_assessments, parse_candidates, parse_structured, split_reasoning,
};
use crate::deliberation::{
    dedupe_candidates, ActionSeed, Candidate, DeliberationSettings, FinalizedActions,
    FinalizedTasks, Stage, StagePrompt, StageRecord, SubjectKind,
};
use crate::llm::{LlmClient, Message};
use crate::memory::{MemoryEntry, MemoryManager, MemoryQuery};
use crate::tasks::{Action, Metric, Task, TaskManager};
use crate::tools::ToolCatalog;

/// 一次审议的输入
#[derive(Debug, Clone)]
pub struct DeliberationRequest {
    pub kind: SubjectKind,
    /// 用户消息或自主建议的目标描述
    pub objective: String,
    /// 写入 Task.created_by
    pub requester: String,
    pub seeds: Vec<ActionSeed>,
    /// 外部数据源等附加上下文
    pub extra_context: Option<String>,
    /// 触发本次审议的指标，随定稿任务一并保存
    pub metrics: BTreeMap<String, Metric>,
}

impl DeliberationRequest {
    pub fn tasks(objective: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Task,
            objective: objective.into(),
            requester: requester.into(),
            seeds: Vec::new(),
            extra_context: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn actions(objective: impl Into<String>, requester: impl Into<String>, seeds: Vec<ActionSeed>) -> Self {
        Self {
            kind: SubjectKind::Action,
            seeds,
            ..Self::tasks(objective, requester)
        }
    }

    pub fn with_extra_context(mut self, context: Option<String>) -> Self {
        self.extra_context = context;
        self
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, Metric>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// 在某阶段被淘汰的候选
#[derive(Debug, Clone)]
pub struct DroppedCandidate {
    pub stage: Stage,
    pub candidate: Candidate,
    pub reason: String,
}

/// 审议结果（尚未提交）
#[derive(Debug, Clone)]
pub struct DeliberationOutcome {
    pub kind: SubjectKind,
    pub tasks: Vec<Task>,
    pub actions: Vec<Action>,
    pub trace: Vec<StageRecord>,
    pub dropped: Vec<DroppedCandidate>,
}

impl DeliberationOutcome {
    fn empty(kind: SubjectKind, trace: Vec<StageRecord>, dropped: Vec<DroppedCandidate>) -> Self {
        Self {
            kind,
            tasks: Vec::new(),
            actions: Vec::new(),
            trace,
            dropped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.actions.is_empty()
    }
}

enum Finalized {
    Tasks(Vec<Task>),
    Actions(Vec<Action>),
}

/// 单次运行的可变状态
struct Run<'a> {
    req: &'a DeliberationRequest,
    candidates: Vec<Candidate>,
    trace: Vec<StageRecord>,
    dropped: Vec<DroppedCandidate>,
    hint: Option<String>,
}

pub struct DeliberationPipeline {
    llm: Arc<dyn LlmClient>,
    memory: Arc<MemoryManager>,
    tasks: Arc<TaskManager>,
    settings: DeliberationSettings,
    system_prompt: String,
}

impl DeliberationPipeline {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        memory: Arc<MemoryManager>,
        tasks: Arc<TaskManager>,
        settings: DeliberationSettings,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            memory,
            tasks,
            settings,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn settings(&self) -> &DeliberationSettings {
        &self.settings
    }

    fn catalog(&self) -> &ToolCatalog {
        self.tasks.catalog()
    }

    /// 审议并把定稿任务作为一批提交（全有或全无）
    pub async fn plan_tasks(
        &self,
        req: &DeliberationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>, AgentError> {
        let req = DeliberationRequest {
            kind: SubjectKind::Task,
            ..req.clone()
        };
        let outcome = self.deliberate(&req, cancel).await?;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if outcome.tasks.is_empty() {
            tracing::info!(objective = %req.objective, "deliberation produced no tasks");
            return Ok(Vec::new());
        }
        let tasks: Vec<Task> = outcome
            .tasks
            .into_iter()
            .map(|mut t| {
                t.metrics = req.metrics.clone();
                t
            })
            .collect();
        let added = self.tasks.add_batch(tasks).await?;
        self.commit_plan(&req, &outcome.trace, json!(added.iter().map(|t| &t.name).collect::<Vec<_>>()))
            .await;
        Ok(added)
    }

    /// 审议动作，并包装进一个承载任务提交；没有动作时返回 None
    pub async fn plan_actions(
        &self,
        req: &DeliberationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>, AgentError> {
        let req = DeliberationRequest {
            kind: SubjectKind::Action,
            ..req.clone()
        };
        let outcome = self.deliberate(&req, cancel).await?;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if outcome.actions.is_empty() {
            tracing::info!(objective = %req.objective, "deliberation produced no actions");
            return Ok(None);
        }

        let mut carrier = Task::new(carrier_name(&req.objective), req.objective.clone())
            .with_priority(1.0)
            .with_created_by(req.requester.clone());
        let mut tools: Vec<String> = Vec::new();
        for action in &outcome.actions {
            if !tools.contains(&action.action_type) {
                tools.push(action.action_type.clone());
            }
        }
        carrier.execution_steps = outcome
            .actions
            .iter()
            .map(|a| format!("{}.{}", a.action_type, a.name))
            .collect();
        carrier.tools = tools;
        carrier.actions = outcome
            .actions
            .into_iter()
            .map(|a| Action {
                task_id: carrier.id.clone(),
                ..a
            })
            .collect();

        let added = self.tasks.add_task(carrier).await?;
        self.commit_plan(&req, &outcome.trace, json!(added.execution_steps)).await;
        Ok(Some(added))
    }

    /// 运行五个阶段，返回尚未提交的定稿结果
    pub async fn deliberate(
        &self,
        req: &DeliberationRequest,
        cancel: &CancellationToken,
    ) -> Result<DeliberationOutcome, AgentError> {
        let mut run = Run {
            req,
            candidates: Vec::new(),
            trace: Vec::new(),
            dropped: Vec::new(),
            hint: None,
        };
        tracing::info!(kind = %req.kind, objective = %req.objective, "deliberation started");

        self.generate(&mut run, cancel).await?;
        self.evaluate(&mut run, cancel).await?;
        self.reconsider(&mut run, cancel).await?;
        self.refine(&mut run, cancel).await?;

        if run.candidates.is_empty() {
            tracing::info!(kind = %req.kind, dropped = run.dropped.len(), "no candidates survived refinement");
            return Ok(DeliberationOutcome::empty(req.kind, run.trace, run.dropped));
        }

        let finalized = self.finalize(&mut run, cancel).await?;
        let mut outcome = DeliberationOutcome::empty(req.kind, run.trace, run.dropped);
        match finalized {
            Finalized::Tasks(tasks) => outcome.tasks = tasks,
            Finalized::Actions(actions) => outcome.actions = actions,
        }
        tracing::info!(
            kind = %req.kind,
            finalized = outcome.tasks.len() + outcome.actions.len(),
            dropped = outcome.dropped.len(),
            "deliberation finished"
        );
        Ok(outcome)
    }

    async fn generate(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), AgentError> {
        let kind = run.req.kind;
        let min = self.settings.min_candidates(kind);
        let mut retry_note: Option<String> = None;

        loop {
            let attempt = usize::from(retry_note.is_some());
            let reply = self
                .call_stage(run, Stage::Generate, retry_note.as_deref(), cancel)
                .await?;
            let (body, reasoning) = split_reasoning(&reply);
            let candidates = match parse_candidates(&reply) {
                Ok(c) => dedupe_candidates(c, kind),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "generate reply not parseable");
                    Vec::new()
                }
            };
            let got = candidates.len();
            if got >= min {
                run.trace.push(StageRecord {
                    stage: Stage::Generate,
                    output: body,
                    reasoning,
                    candidate_count: got,
                    kept_previous: false,
                });
                run.candidates = candidates;
                return Ok(());
            }
            tracing::warn!(%kind, got, min, attempt, "generation underflow");
            if retry_note.is_some() {
                return Err(AgentError::GenerationUnderflow { kind, got, min });
            }
            retry_note = Some(format!("it contained {got} distinct candidates but at least {min} are required"));
        }
    }

    async fn evaluate(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), AgentError> {
        let reply = self.call_stage(run, Stage::Evaluate, None, cancel).await?;
        let (body, reasoning) = split_reasoning(&reply);

        let kept_previous = match parse_assessments(&reply) {
            Ok(assessments) => {
                let by_name: HashMap<String, _> = assessments
                    .into_iter()
                    .map(|(name, a)| (name.trim().to_lowercase(), a))
                    .collect();
                for candidate in &mut run.candidates {
                    if let Some(a) = by_name.get(&candidate.name_key()) {
                        candidate.assessment = Some(a.clone());
                    }
                }
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "evaluate reply not parseable, candidates left unassessed");
                true
            }
        };

        // 评估文本（含推理）中出现的重新考虑措辞作为下一阶段的提示
        let scan = match &reasoning {
            Some(r) => format!("{r}\n{body}"),
            None => body.clone(),
        };
        if let Some(insight) = detect_reconsideration(&scan) {
            tracing::info!(insight = %insight, "reconsideration insight detected during evaluation");
            run.hint = Some(insight);
        }

        run.trace.push(StageRecord {
            stage: Stage::Evaluate,
            output: body,
            reasoning,
            candidate_count: run.candidates.len(),
            kept_previous,
        });
        Ok(())
    }

    async fn reconsider(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), AgentError> {
        let reply = self.call_stage(run, Stage::Reconsider, None, cancel).await?;
        let (body, reasoning) = split_reasoning(&reply);
        let kind = run.req.kind;

        let kept_previous = match parse_candidates(&reply) {
            Ok(next) => {
                let mut next = dedupe_candidates(next, kind);
                carry_assessments(&run.candidates, &mut next);
                let removed = removed_candidates(&run.candidates, &next, kind);
                for candidate in removed {
                    self.drop_candidate(run, Stage::Reconsider, candidate, "removed during reconsideration")
                        .await;
                }
                run.candidates = next;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "reconsider reply not parseable, keeping previous candidates");
                true
            }
        };

        run.trace.push(StageRecord {
            stage: Stage::Reconsider,
            output: body,
            reasoning,
            candidate_count: run.candidates.len(),
            kept_previous,
        });
        Ok(())
    }

    async fn refine(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<(), AgentError> {
        let reply = self.call_stage(run, Stage::Refine, None, cancel).await?;
        let (body, reasoning) = split_reasoning(&reply);
        let kind = run.req.kind;

        let kept_previous = match parse_candidates(&reply) {
            Ok(next) => {
                let mut next = dedupe_candidates(next, kind);
                carry_assessments(&run.candidates, &mut next);
                let omitted = removed_candidates(&run.candidates, &next, kind);
                for candidate in omitted {
                    self.drop_candidate(run, Stage::Refine, candidate, "omitted by refinement")
                        .await;
                }
                run.candidates = next;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "refine reply not parseable, keeping previous candidates");
                true
            }
        };

        // 工具过滤：所需工具必须全部可用
        let candidates = std::mem::take(&mut run.candidates);
        for candidate in candidates {
            let missing: Vec<String> = candidate
                .required_tools()
                .into_iter()
                .filter(|t| !self.catalog().contains_tool(t))
                .collect();
            if missing.is_empty() {
                run.candidates.push(candidate);
            } else {
                let reason = format!("unavailable tools: {}", missing.join(", "));
                self.drop_candidate(run, Stage::Refine, candidate, &reason).await;
            }
        }

        run.trace.push(StageRecord {
            stage: Stage::Refine,
            output: body,
            reasoning,
            candidate_count: run.candidates.len(),
            kept_previous,
        });
        Ok(())
    }

    async fn finalize(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<Finalized, AgentError> {
        let mut retry_note: Option<String> = None;
        loop {
            let attempt = usize::from(retry_note.is_some());
            let reply = self
                .call_stage(run, Stage::Finalize, retry_note.as_deref(), cancel)
                .await?;
            match self.validate_finalized(run, &reply) {
                Ok(finalized) => {
                    let (body, reasoning) = split_reasoning(&reply);
                    run.trace.push(StageRecord {
                        stage: Stage::Finalize,
                        output: body,
                        reasoning,
                        candidate_count: run.candidates.len(),
                        kept_previous: false,
                    });
                    return Ok(finalized);
                }
                Err(reason) => {
                    tracing::warn!(attempt, reason = %reason, "finalize output rejected");
                    if retry_note.is_some() {
                        return Err(AgentError::DeliberationFailed(format!(
                            "finalize failed twice: {reason}"
                        )));
                    }
                    retry_note = Some(reason);
                }
            }
        }
    }

    fn validate_finalized(&self, run: &Run<'_>, reply: &str) -> Result<Finalized, String> {
        let expected = run.candidates.len();
        match run.req.kind {
            SubjectKind::Task => {
                let parsed: FinalizedTasks = parse_structured(reply)?;
                if parsed.tasks.len() != expected {
                    return Err(format!("expected {expected} tasks, got {}", parsed.tasks.len()));
                }
                let tasks: Vec<Task> = parsed
                    .tasks
                    .into_iter()
                    .map(|spec| spec.into_task(&run.req.requester))
                    .collect();
                for task in &tasks {
                    task.validate(Some(self.catalog())).map_err(|e| e.to_string())?;
                }
                Ok(Finalized::Tasks(tasks))
            }
            SubjectKind::Action => {
                let parsed: FinalizedActions = parse_structured(reply)?;
                if parsed.actions.len() != expected {
                    return Err(format!("expected {expected} actions, got {}", parsed.actions.len()));
                }
                let actions: Vec<Action> = parsed.actions.into_iter().map(|a| a.into_action()).collect();
                for action in &actions {
                    action.validate(self.catalog()).map_err(|e| e.to_string())?;
                }
                Ok(Finalized::Actions(actions))
            }
        }
    }

    /// 拉取记忆、拼 prompt、调用 LLM；全程可被取消
    async fn call_stage(
        &self,
        run: &Run<'_>,
        stage: Stage,
        retry_note: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let memory_context = self.memory_context(run.req, cancel).await?;
        let tools_section = self.catalog().prompt_section();
        let prompt = StagePrompt {
            kind: run.req.kind,
            stage,
            objective: &run.req.objective,
            candidates: &run.candidates,
            trace: &run.trace,
            memory_context: &memory_context,
            tools_section: &tools_section,
            seeds: &run.req.seeds,
            extra_context: run.req.extra_context.as_deref(),
            min_candidates: self.settings.min_candidates(run.req.kind),
            hint: if stage == Stage::Reconsider { run.hint.as_deref() } else { None },
            retry_note,
        };
        let messages: Vec<Message> = prompt.to_messages(&self.system_prompt);
        tracing::debug!(%stage, kind = %run.req.kind, candidates = run.candidates.len(), "stage prompt built");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            reply = self.llm.complete(&messages) => reply.map_err(AgentError::from),
        }
    }

    async fn memory_context(&self, req: &DeliberationRequest, cancel: &CancellationToken) -> Result<String, AgentError> {
        let query = MemoryQuery::new()
            .with_text(req.objective.clone())
            .with_limit(self.settings.context_limit);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.memory.fetch_context(&query) => r,
        };
        match fetched {
            Ok(entries) => Ok(MemoryManager::render_context(&entries)),
            Err(e) => {
                tracing::warn!(error = %e, "memory context unavailable for deliberation");
                Ok(MemoryManager::render_context(&[]))
            }
        }
    }

    async fn drop_candidate(&self, run: &mut Run<'_>, stage: Stage, candidate: Candidate, reason: &str) {
        tracing::info!(%stage, candidate = %candidate.name, reason, "candidate dropped");
        let favorable = candidate.assessment.as_ref().is_some_and(|a| a.is_favorable());
        let entry = MemoryEntry::new(
            "candidate_dropped",
            json!({
                "stage": stage,
                "kind": run.req.kind,
                "objective": run.req.objective,
                "candidate": candidate,
                "reason": reason,
            }),
        )
        .with_importance(if favorable { 0.6 } else { 0.3 })
        .with_tag("deliberation")
        .with_tag(format!("stage:{stage}"))
        .with_metadata("previously_favorable", json!(favorable));
        if let Err(e) = self.memory.commit(entry).await {
            tracing::warn!(error = %e, candidate = %candidate.name, "dropped candidate not recorded");
        }
        run.dropped.push(DroppedCandidate {
            stage,
            candidate,
            reason: reason.to_string(),
        });
    }

    async fn commit_plan(&self, req: &DeliberationRequest, trace: &[StageRecord], items: serde_json::Value) {
        let stages: Vec<serde_json::Value> = trace
            .iter()
            .map(|r| json!({ "stage": r.stage, "candidates": r.candidate_count, "kept_previous": r.kept_previous }))
            .collect();
        let entry = MemoryEntry::new(
            "plan_finalized",
            json!({
                "kind": req.kind,
                "objective": req.objective,
                "requester": req.requester,
                "items": items,
                "stages": stages,
            }),
        )
        .with_importance(0.7)
        .with_tag("deliberation")
        .with_tag(format!("plan:{}", req.kind));
        if let Err(e) = self.memory.commit(entry).await {
            tracing::warn!(error = %e, "plan summary not recorded");
        }
    }
}

/// 新集合中同名候选继承上一轮的评估
fn carry_assessments(previous: &[Candidate], next: &mut [Candidate]) {
    for candidate in next.iter_mut().filter(|c| c.assessment.is_none()) {
        if let Some(prev) = previous.iter().find(|p| p.name_key() == candidate.name_key()) {
            candidate.assessment = prev.assessment.clone();
        }
    }
}

/// 上一轮存在、新集合中按名称找不到的候选
fn removed_candidates(previous: &[Candidate], next: &[Candidate], kind: SubjectKind) -> Vec<Candidate> {
    previous
        .iter()
        .filter(|p| {
            !next.iter().any(|n| match kind {
                SubjectKind::Task => n.name_key() == p.name_key(),
                SubjectKind::Action => {
                    n.name_key() == p.name_key() && n.action_type == p.action_type
                }
            })
        })
        .cloned()
        .collect()
}

fn carrier_name(objective: &str) -> String {
    let short: String = objective.trim().chars().take(60).collect();
    if short.is_empty() {
        "Execute planned actions".to_string()
    } else {
        format!("Execute: {short}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_candidates_by_name() {
        let prev = vec![Candidate::task("A"), Candidate::task("B")];
        let next = vec![Candidate::task("a"), Candidate::task("C")];
        let removed = removed_candidates(&prev, &next, SubjectKind::Task);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "B");
    }

    #[test]
    fn test_carrier_name() {
        assert_eq!(carrier_name("  "), "Execute planned actions");
        assert_eq!(carrier_name("post gm"), "Execute: post gm");
    }
}
