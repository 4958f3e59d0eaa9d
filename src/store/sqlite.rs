//! SQLite 记录存储
//!
//! 单表 `records(seq, kind, id, body, updated_at)`，`seq` 自增保证插入顺序；body 为 Record 的 JSON。
//! rusqlite 为同步 API，所有调用经 `spawn_blocking` 执行，连接由 Mutex 串行化。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::store::{Record, RecordKind, RecordStore, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(map_sql_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sql_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(kind, id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind, seq);",
        )
        .map_err(map_sql_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn map_sql_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn decode(body: &str) -> Result<Record, StoreError> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create(&self, record: Record) -> Result<(), StoreError> {
        let kind = record.kind();
        let id = record.id().to_string();
        let body = serde_json::to_string(&record)?;
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO records (kind, id, body, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![kind.as_str(), id, body, chrono::Utc::now().to_rfc3339()],
                )
                .map_err(map_sql_error)?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists { kind, id });
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sql_error)?;
            body.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn update(&self, record: Record) -> Result<(), StoreError> {
        let kind = record.kind();
        let id = record.id().to_string();
        let body = serde_json::to_string(&record)?;
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE records SET body = ?3, updated_at = ?4 WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id, body, chrono::Utc::now().to_rfc3339()],
                )
                .map_err(map_sql_error)?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind, id });
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM records WHERE kind = ?1 ORDER BY seq ASC")
                .map_err(map_sql_error)?;
            let bodies = stmt
                .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))
                .map_err(map_sql_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sql_error)?;
            bodies.iter().map(|b| decode(b)).collect()
        })
        .await
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                )
                .map_err(map_sql_error)?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Task, TaskStatus};

    #[tokio::test]
    async fn test_task_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("agent.db");

        let task = Task::new("t", "follow up with holders");
        let id = task.id.clone();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(Record::Task(task)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let got = store
            .get(RecordKind::Task, &id)
            .await
            .unwrap()
            .and_then(Record::into_task)
            .unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.name, "t");
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = Task::new("a", "b");
        store.create(Record::Task(task.clone())).await.unwrap();
        assert!(matches!(
            store.create(Record::Task(task.clone())).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(store.delete(RecordKind::Task, &task.id).await.unwrap());
        assert!(matches!(
            store.update(Record::Task(task)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_in_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for name in ["first", "second", "third"] {
            let task = Task::new(name, "desc");
            ids.push(task.id.clone());
            store.create(Record::Task(task)).await.unwrap();
        }
        let listed: Vec<String> = store
            .list(RecordKind::Task)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(listed, ids);
    }
}
