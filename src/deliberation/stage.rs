//! 审议阶段状态机与阶段记录

use std::fmt;

use serde::{Deserialize, Serialize};

/// 审议对象：任务集合或动作集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Task,
    Action,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Task => "task",
            SubjectKind::Action => "action",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            SubjectKind::Task => "tasks",
            SubjectKind::Action => "actions",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate → Evaluate → Reconsider → Refine → Finalize → Done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Generate,
    Evaluate,
    Reconsider,
    Refine,
    Finalize,
    Done,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Generate => Stage::Evaluate,
            Stage::Evaluate => Stage::Reconsider,
            Stage::Reconsider => Stage::Refine,
            Stage::Refine => Stage::Finalize,
            Stage::Finalize | Stage::Done => Stage::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Evaluate => "evaluate",
            Stage::Reconsider => "reconsider",
            Stage::Refine => "refine",
            Stage::Finalize => "finalize",
            Stage::Done => "done",
        }
    }

    /// 每个阶段在思维链中的用途
    pub fn purpose(self) -> &'static str {
        match self {
            Stage::Generate => "initial brainstorming",
            Stage::Evaluate => "critical analysis",
            Stage::Reconsider => "reconsideration of alternatives",
            Stage::Refine => "refinement into tool-bound steps",
            Stage::Finalize => "concrete structured output",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个阶段的输出记录，累积成下一阶段 prompt 的 trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    /// 去掉 <think> 块后的模型输出
    pub output: String,
    /// <think> 块中的推理（若有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub candidate_count: usize,
    /// 模型回复不可解析时为 true（沿用上一阶段的候选集）
    #[serde(default)]
    pub kept_previous: bool,
}

/// 审议配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliberationSettings {
    #[serde(default = "default_min_task_candidates")]
    pub min_task_candidates: usize,
    #[serde(default = "default_min_action_candidates")]
    pub min_action_candidates: usize,
    /// 每阶段拉取的记忆条数
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

fn default_min_task_candidates() -> usize {
    2
}

fn default_min_action_candidates() -> usize {
    5
}

fn default_context_limit() -> usize {
    10
}

impl Default for DeliberationSettings {
    fn default() -> Self {
        Self {
            min_task_candidates: default_min_task_candidates(),
            min_action_candidates: default_min_action_candidates(),
            context_limit: default_context_limit(),
        }
    }
}

impl DeliberationSettings {
    pub fn min_candidates(&self, kind: SubjectKind) -> usize {
        match kind {
            SubjectKind::Task => self.min_task_candidates,
            SubjectKind::Action => self.min_action_candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Generate;
        let mut seen = vec![stage];
        while stage != Stage::Done {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Generate,
                Stage::Evaluate,
                Stage::Reconsider,
                Stage::Refine,
                Stage::Finalize,
                Stage::Done
            ]
        );
    }

    #[test]
    fn test_min_candidates_by_kind() {
        let s = DeliberationSettings::default();
        assert_eq!(s.min_candidates(SubjectKind::Task), 2);
        assert_eq!(s.min_candidates(SubjectKind::Action), 5);
    }
}
