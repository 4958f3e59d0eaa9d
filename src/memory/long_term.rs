//! 长期记忆：跨会话持久化的记忆条目
//!
//! `StoreLongTerm` 以 RecordStore 为后端；检索结果按 importance 降序、timestamp 降序排列，
//! 同分保持插入顺序（稳定排序 + store.list 的插入顺序）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::memory::{MemoryEntry, MemoryQuery};
use crate::store::{retry_transient, Record, RecordKind, RecordStore, StoreError};

/// 长期记忆 trait
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> Result<(), StoreError>;

    /// 返回匹配条目（已排序、已按 limit 截断）
    async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError>;

    async fn update(&self, entry: MemoryEntry) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn store(&self, _entry: MemoryEntry) -> Result<(), StoreError> {
        Ok(())
    }

    async fn retrieve(&self, _query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        Ok(None)
    }

    async fn update(&self, _entry: MemoryEntry) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 基于 RecordStore 的长期记忆
#[derive(Clone)]
pub struct StoreLongTerm {
    store: Arc<dyn RecordStore>,
    retry_backoff: Duration,
}

impl StoreLongTerm {
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
}

/// importance 降序，其次 timestamp 降序；稳定排序保留插入顺序
pub fn rank_entries(entries: &mut [MemoryEntry]) {
    entries.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

#[async_trait]
impl LongTermMemory for StoreLongTerm {
    async fn store(&self, entry: MemoryEntry) -> Result<(), StoreError> {
        retry_transient(self.retry_backoff, || {
            self.store.create(Record::Memory(entry.clone()))
        })
        .await
    }

    async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        let records =
            retry_transient(self.retry_backoff, || self.store.list(RecordKind::Memory)).await?;
        let mut hits: Vec<MemoryEntry> = records
            .into_iter()
            .filter_map(Record::into_memory)
            .filter(|e| query.matches(e))
            .collect();
        rank_entries(&mut hits);
        query.truncate(&mut hits);
        Ok(hits)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let record =
            retry_transient(self.retry_backoff, || self.store.get(RecordKind::Memory, id)).await?;
        Ok(record.and_then(Record::into_memory))
    }

    async fn update(&self, entry: MemoryEntry) -> Result<(), StoreError> {
        retry_transient(self.retry_backoff, || {
            self.store.update(Record::Memory(entry.clone()))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        retry_transient(self.retry_backoff, || {
            self.store.delete(RecordKind::Memory, id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn entry(id: &str, importance: f64, age_secs: i64) -> MemoryEntry {
        let mut e = MemoryEntry::new("fact", json!(id))
            .with_importance(importance)
            .with_timestamp(Utc::now() - ChronoDuration::seconds(age_secs));
        e.id = id.to_string();
        e
    }

    #[tokio::test]
    async fn test_retrieve_orders_by_importance_then_recency() {
        let lt = StoreLongTerm::new(Arc::new(InMemoryStore::new()));
        let base = Utc::now();
        let mut tie_a = entry("tie_a", 0.5, 0);
        let mut tie_b = entry("tie_b", 0.5, 0);
        tie_a.timestamp = base;
        tie_b.timestamp = base;

        lt.store(entry("old_low", 0.1, 100)).await.unwrap();
        lt.store(tie_a).await.unwrap();
        lt.store(entry("high", 0.9, 50)).await.unwrap();
        lt.store(tie_b).await.unwrap();
        lt.store(entry("new_low", 0.1, 1)).await.unwrap();

        let got: Vec<String> = lt
            .retrieve(&MemoryQuery::new())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(got, vec!["high", "tie_a", "tie_b", "new_low", "old_low"]);

        let limited = lt.retrieve(&MemoryQuery::new().with_limit(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_noop_is_disabled() {
        let lt = NoopLongTerm;
        assert!(!lt.enabled());
        lt.store(entry("x", 1.0, 0)).await.unwrap();
        assert!(lt.retrieve(&MemoryQuery::new()).await.unwrap().is_empty());
    }
}
