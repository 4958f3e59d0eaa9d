//! 记忆条目与查询条件

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::AgentError;

/// 单条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    /// 自由类型标签，如 "message" / "task_transition" / "candidate_dropped"
    pub kind: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub importance: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            content,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            importance: 0.0,
            tags: BTreeSet::new(),
            embedding: None,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if !self.importance.is_finite() || self.importance < 0.0 {
            return Err(AgentError::Validation(format!(
                "memory importance must be a finite value >= 0, got {}",
                self.importance
            )));
        }
        if self.kind.trim().is_empty() {
            return Err(AgentError::Validation("memory kind must not be empty".into()));
        }
        Ok(())
    }

    /// 用于嵌入与 prompt 的纯文本形式（字符串内容去引号）
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 时间范围：[start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// 记忆查询；所有条件为 AND，`tags` 要求全部命中，`limit == 0` 表示不限
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub tags: BTreeSet<String>,
    pub time_range: Option<TimeRange>,
    pub kind: Option<String>,
    pub min_importance: Option<f64>,
    /// 用于生成查询嵌入的文本（仅在配置了嵌入器时生效）
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub min_similarity: f32,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some(TimeRange { start, end });
        self
    }

    pub fn with_min_importance(mut self, min: f64) -> Self {
        self.min_importance = Some(min);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if !self.tags.is_subset(&entry.tags) {
            return false;
        }
        if let Some(range) = &self.time_range {
            if !range.contains(entry.timestamp) {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &entry.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if entry.importance < min {
                return false;
            }
        }
        // 只有双方都有向量时才按相似度过滤
        if let (Some(q), Some(e)) = (&self.embedding, &entry.embedding) {
            if cosine_similarity(q, e) < self.min_similarity {
                return false;
            }
        }
        true
    }

    pub(crate) fn truncate<T>(&self, items: &mut Vec<T>) {
        if self.limit > 0 {
            items.truncate(self.limit);
        }
    }
}

/// 余弦相似度；长度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// 工作记忆快照（持久化用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingSnapshot {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<MemoryEntry>,
}
