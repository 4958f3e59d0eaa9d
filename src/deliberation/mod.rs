//! 审议层：把意图转为经过多轮推敲的任务 / 动作
//!
//! 五个阶段（生成 → 评估 → 重新考虑 → 精炼 → 定稿）对任务与动作结构相同，只由 SubjectKind 区分。

pub mod candidate;
pub mod parse;
pub mod pipeline;
pub mod prompt;
pub mod stage;

pub use candidate::{
    dedupe_candidates, ActionSeed, ActionSpec, Assessment, Candidate, FinalizedActions,
    FinalizedTasks, TaskSpec,
};
pub use pipeline::{DeliberationOutcome, DeliberationPipeline, DeliberationRequest, DroppedCandidate};
pub use prompt::StagePrompt;
pub use stage::{DeliberationSettings, Stage, StageRecord, SubjectKind};
