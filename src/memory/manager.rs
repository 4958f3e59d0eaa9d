//! 记忆管理器：工作记忆 + 长期记忆的统一入口
//!
//! - `record`：校验后写入工作记忆，不等待长期持久化
//! - `commit`：写入长期记忆（配置了嵌入器且条目无向量时先嵌入）
//! - `fetch_context`：工作记忆（最新在前）→ 长期记忆（importance / timestamp 降序），按 id 去重后截断
//!
//! 长期写入失败只返回给调用方，不回滚已写入的工作记忆。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::core::AgentError;
use crate::llm::EmbeddingProvider;
use crate::memory::{
    LongTermMemory, MemoryEntry, MemoryQuery, WorkingMemory, WorkingSnapshot,
};
use crate::store::{Record, RecordKind, RecordStore};

pub struct MemoryManager {
    working: WorkingMemory,
    long_term: Arc<dyn LongTermMemory>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// 工作记忆快照的存放处；None 时 snapshot / restore 为空操作
    snapshots: Option<Arc<dyn RecordStore>>,
}

impl MemoryManager {
    pub fn new(working_capacity: usize, long_term: Arc<dyn LongTermMemory>) -> Self {
        Self {
            working: WorkingMemory::new(working_capacity),
            long_term,
            embedder: None,
            snapshots: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn long_term_enabled(&self) -> bool {
        self.long_term.enabled()
    }

    pub fn record(&self, entry: MemoryEntry) -> Result<(), AgentError> {
        entry.validate()?;
        tracing::debug!(kind = %entry.kind, id = %entry.id, "memory recorded");
        self.working.add(entry);
        Ok(())
    }

    pub async fn commit(&self, mut entry: MemoryEntry) -> Result<(), AgentError> {
        entry.validate()?;
        if entry.embedding.is_none() {
            if let Some(embedder) = &self.embedder {
                match embedder.embed(&entry.content_text()).await {
                    Ok(v) if !v.is_empty() => entry.embedding = Some(v),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, id = %entry.id, "embedding failed, storing without vector"),
                }
            }
        }
        tracing::debug!(kind = %entry.kind, id = %entry.id, "memory committed");
        self.long_term.store(entry).await?;
        Ok(())
    }

    /// record + commit；长期写入失败时工作记忆中的条目保留
    pub async fn remember(&self, entry: MemoryEntry) -> Result<(), AgentError> {
        self.record(entry.clone())?;
        self.commit(entry).await
    }

    pub async fn fetch_context(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, AgentError> {
        let mut query = query.clone();
        if query.embedding.is_none() {
            if let (Some(embedder), Some(text)) = (&self.embedder, query.text.as_deref()) {
                match embedder.embed(text).await {
                    Ok(v) if !v.is_empty() => query.embedding = Some(v),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "query embedding failed, similarity filter skipped"),
                }
            }
        }

        let mut seen = HashSet::new();
        let mut out: Vec<MemoryEntry> = self
            .working
            .query(&query)
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();

        if query.limit == 0 || out.len() < query.limit {
            let long_term = self.long_term.retrieve(&query).await?;
            out.extend(long_term.into_iter().filter(|e| seen.insert(e.id.clone())));
        }
        query.truncate(&mut out);
        Ok(out)
    }

    /// 工作记忆最近 n 条（时间先后）
    pub fn get_recent(&self, n: usize) -> Vec<MemoryEntry> {
        self.working.get_recent(n)
    }

    /// 将工作记忆整体保存为一条 WorkingSnapshot 记录
    pub async fn snapshot_working(&self) -> Result<Option<String>, AgentError> {
        let Some(store) = &self.snapshots else {
            return Ok(None);
        };
        let snapshot = WorkingSnapshot {
            id: Uuid::new_v4().to_string(),
            taken_at: Utc::now(),
            entries: self.working.snapshot(),
        };
        let id = snapshot.id.clone();
        let count = snapshot.entries.len();
        store.create(Record::WorkingSnapshot(snapshot)).await?;
        tracing::info!(snapshot = %id, entries = count, "working memory snapshot saved");

        // 只保留最新一份
        for old in store.list(RecordKind::WorkingSnapshot).await? {
            if old.id() == id {
                continue;
            }
            if let Err(e) = store.delete(RecordKind::WorkingSnapshot, old.id()).await {
                tracing::warn!(error = %e, snapshot = %old.id(), "stale snapshot not removed");
            }
        }
        Ok(Some(id))
    }

    /// 启动时载入最近一次快照；返回恢复的条目数
    pub async fn restore_working(&self) -> Result<usize, AgentError> {
        let Some(store) = &self.snapshots else {
            return Ok(0);
        };
        let latest = store
            .list(RecordKind::WorkingSnapshot)
            .await?
            .into_iter()
            .filter_map(Record::into_snapshot)
            .max_by_key(|s| s.taken_at);
        let Some(snapshot) = latest else {
            return Ok(0);
        };
        let count = snapshot.entries.len().min(self.working.capacity());
        self.working.restore(snapshot.entries);
        tracing::info!(snapshot = %snapshot.id, entries = count, "working memory restored");
        Ok(count)
    }

    /// 渲染为 prompt 片段
    pub fn render_context(entries: &[MemoryEntry]) -> String {
        if entries.is_empty() {
            return "(no relevant memory)".to_string();
        }
        entries
            .iter()
            .map(|e| {
                format!(
                    "- [{}] {} ({})",
                    e.kind,
                    e.content_text(),
                    e.timestamp.format("%Y-%m-%d %H:%M:%S")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
