//! 优雅关闭
//!
//! 统一监听关闭信号并按顺序执行清理：
//! - 取消并等待工作池中的作业
//! - 保存工作记忆快照，下次启动时恢复

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, WorkerPool};
use crate::memory::MemoryManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C 或输入结束
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（工作池的根 token）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> Result<(), AgentError>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理，每项有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 取消工作池并等待作业退出
pub struct WorkerPoolCleanup {
    pool: Arc<WorkerPool>,
    grace: Duration,
}

impl WorkerPoolCleanup {
    pub fn new(pool: Arc<WorkerPool>, grace: Duration) -> Self {
        Self { pool, grace }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkerPoolCleanup {
    async fn cleanup(&self) -> Result<(), AgentError> {
        self.pool.shutdown(self.grace).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkerPool"
    }
}

/// 保存工作记忆快照
pub struct WorkingMemoryCleanup {
    memory: Arc<MemoryManager>,
}

impl WorkingMemoryCleanup {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for WorkingMemoryCleanup {
    async fn cleanup(&self) -> Result<(), AgentError> {
        self.memory.snapshot_working().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkingMemory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEntry, NoopLongTerm};
    use crate::store::{InMemoryStore, RecordKind, RecordStore};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
    }

    struct FailingCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for FailingCleanup {
        async fn cleanup(&self) -> Result<(), AgentError> {
            Err(AgentError::Store("disk full".into()))
        }

        fn name(&self) -> &'static str {
            "Failing"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks_after_failure() {
        let store = Arc::new(InMemoryStore::new());
        let memory = Arc::new(
            MemoryManager::new(4, Arc::new(NoopLongTerm))
                .with_snapshot_store(Arc::clone(&store) as Arc<dyn RecordStore>),
        );
        memory
            .record(MemoryEntry::new("message", serde_json::json!("hello")))
            .unwrap();

        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(1);
        coordinator.register(FailingCleanup);
        coordinator.register(WorkingMemoryCleanup::new(Arc::clone(&memory)));
        coordinator.run_cleanup().await;

        let snapshots = store.list(RecordKind::WorkingSnapshot).await.unwrap();
        assert_eq!(snapshots.len(), 1);
    }
}
