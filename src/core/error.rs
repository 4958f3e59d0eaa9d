//! Agent 错误分类
//!
//! - 校验类（Validation / InvalidTransition / NotFound / DuplicateVote）：直接报告给调用方，不自动重试
//! - TransientIo：LLM 或存储调用的网络 / 超时错误，调用点已做过一次有界退避重试
//! - GenerationUnderflow / DeliberationFailed：只中止当前批次，已有状态不变
//!
//! 审批被拒不是错误，而是正常的终态结果（任务进入 Failed）。

use thiserror::Error;

use crate::deliberation::SubjectKind;
use crate::llm::LlmError;
use crate::store::StoreError;
use crate::tasks::TaskStatus;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate vote from stakeholder {0}")]
    DuplicateVote(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("LLM error: {0}")]
    LlmError(LlmError),

    #[error("Generation underflow: {kind} generation produced {got} distinct candidates, need at least {min}")]
    GenerationUnderflow {
        kind: SubjectKind,
        got: usize,
        min: usize,
    },

    #[error("Deliberation failed: {0}")]
    DeliberationFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::TransientIo(_))
    }

    /// 是否只影响当前审议批次（不影响已提交状态）
    pub fn is_batch_abort(&self) -> bool {
        matches!(
            self,
            AgentError::GenerationUnderflow { .. } | AgentError::DeliberationFailed(_)
        )
    }
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            AgentError::TransientIo(err.to_string())
        } else {
            AgentError::LlmError(err)
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => AgentError::NotFound(format!("{kind} {id}")),
            StoreError::Unavailable(msg) => AgentError::TransientIo(msg),
            other => AgentError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordKind;

    #[test]
    fn test_transient_llm_error_maps_to_transient_io() {
        let err: AgentError = LlmError::Timeout.into();
        assert!(err.is_transient());

        let err: AgentError = LlmError::Api("bad key".into()).into();
        assert!(matches!(err, AgentError::LlmError(_)));
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: AgentError = StoreError::NotFound {
            kind: RecordKind::Task,
            id: "t1".into(),
        }
        .into();
        assert!(matches!(err, AgentError::NotFound(ref s) if s.contains("t1")));
    }

    #[test]
    fn test_batch_abort_classification() {
        let err = AgentError::GenerationUnderflow {
            kind: SubjectKind::Action,
            got: 1,
            min: 5,
        };
        assert!(err.is_batch_abort());
        assert!(!AgentError::Cancelled.is_batch_abort());
    }
}
