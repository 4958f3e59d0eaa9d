//! 任务存储：RecordStore 之上的 Task 类型化视图（单条记录操作带一次瞬时重试）

use std::sync::Arc;
use std::time::Duration;

use crate::core::AgentError;
use crate::store::{retry_transient, Record, RecordKind, RecordStore};
use crate::tasks::Task;

#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn RecordStore>,
    retry_backoff: Duration,
}

impl TaskStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub async fn add(&self, task: &Task) -> Result<(), AgentError> {
        retry_transient(self.retry_backoff, || {
            self.store.create(Record::Task(task.clone()))
        })
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Task, AgentError> {
        let record = retry_transient(self.retry_backoff, || self.store.get(RecordKind::Task, id)).await?;
        record
            .and_then(Record::into_task)
            .ok_or_else(|| AgentError::NotFound(format!("task {id}")))
    }

    pub async fn update(&self, task: &Task) -> Result<(), AgentError> {
        retry_transient(self.retry_backoff, || {
            self.store.update(Record::Task(task.clone()))
        })
        .await?;
        Ok(())
    }

    /// 插入顺序
    pub async fn list(&self) -> Result<Vec<Task>, AgentError> {
        let records = retry_transient(self.retry_backoff, || self.store.list(RecordKind::Task)).await?;
        Ok(records.into_iter().filter_map(Record::into_task).collect())
    }

    /// 仅供批量提交失败时回滚本次调用自己插入的记录
    pub(crate) async fn remove(&self, id: &str) -> Result<bool, AgentError> {
        Ok(retry_transient(self.retry_backoff, || self.store.delete(RecordKind::Task, id)).await?)
    }
}
