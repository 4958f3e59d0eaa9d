//! 类型化记录存储
//!
//! 以 `(RecordKind, id)` 为键的通用记录存储：Task、MemoryEntry、WorkingSnapshot 各自是 Record 的一个变体，
//! 取代无类型的 SaveState / GetState。只要求单条记录操作原子；多步操作的原子性由上层（TaskManager）保证。
//! `list` 按插入顺序返回，长期记忆依赖它做同分排序。

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{MemoryEntry, WorkingSnapshot};
use crate::tasks::Task;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// 记录类别（每类一张逻辑表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Task,
    Memory,
    WorkingSnapshot,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Task => "task",
            RecordKind::Memory => "memory",
            RecordKind::WorkingSnapshot => "working_snapshot",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 类型化记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Record {
    Task(Task),
    Memory(MemoryEntry),
    WorkingSnapshot(WorkingSnapshot),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Task(_) => RecordKind::Task,
            Record::Memory(_) => RecordKind::Memory,
            Record::WorkingSnapshot(_) => RecordKind::WorkingSnapshot,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Task(t) => &t.id,
            Record::Memory(m) => &m.id,
            Record::WorkingSnapshot(s) => &s.id,
        }
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            Record::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_memory(self) -> Option<MemoryEntry> {
        match self {
            Record::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_snapshot(self) -> Option<WorkingSnapshot> {
        match self {
            Record::WorkingSnapshot(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} record {id} not found")]
    NotFound { kind: RecordKind, id: String },

    #[error("{kind} record {id} already exists")]
    AlreadyExists { kind: RecordKind, id: String },

    /// 后端暂不可用（锁忙、连接中断），可重试
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// 记录存储 trait：Create / Get / Update / List / Delete
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 新建记录；同键已存在时返回 AlreadyExists
    async fn create(&self, record: Record) -> Result<(), StoreError>;

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// 覆盖已有记录（保持插入位置）；不存在时返回 NotFound
    async fn update(&self, record: Record) -> Result<(), StoreError>;

    /// 按插入顺序列出某类全部记录
    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError>;

    /// 删除记录，返回是否存在
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError>;
}

/// 存储调用点的有界重试：瞬时错误退避一次后重试，仍失败则返回
pub async fn retry_transient<T, F, Fut>(backoff: Duration, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(err) if err.is_transient() => {
            tracing::warn!(error = %err, "store call failed, retrying once");
            tokio::time::sleep(backoff).await;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_transient_once() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, StoreError> = retry_transient(Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(StoreError::Unavailable("busy".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, StoreError> = retry_transient(Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Backend("corrupt".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
