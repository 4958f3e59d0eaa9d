//! 内存记录存储：每类记录一张表（插入顺序 + id 索引），用于测试与 `storage.backend = "memory"`

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::{Record, RecordKind, RecordStore, StoreError};

#[derive(Default)]
struct Table {
    order: Vec<String>,
    rows: HashMap<String, Record>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<RecordKind, Table>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create(&self, record: Record) -> Result<(), StoreError> {
        let kind = record.kind();
        let id = record.id().to_string();
        let mut tables = self.tables.write().await;
        let table = tables.entry(kind).or_default();
        if table.rows.contains_key(&id) {
            return Err(StoreError::AlreadyExists { kind, id });
        }
        table.order.push(id.clone());
        table.rows.insert(id, record);
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&kind).and_then(|t| t.rows.get(id).cloned()))
    }

    async fn update(&self, record: Record) -> Result<(), StoreError> {
        let kind = record.kind();
        let mut tables = self.tables.write().await;
        let slot = tables
            .get_mut(&kind)
            .and_then(|t| t.rows.get_mut(record.id()));
        match slot {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind,
                id: record.id().to_string(),
            }),
        }
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|t| {
                t.order
                    .iter()
                    .filter_map(|id| t.rows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(&kind) else {
            return Ok(false);
        };
        if table.rows.remove(id).is_none() {
            return Ok(false);
        }
        table.order.retain(|k| k != id);
        Ok(true)
    }
}
