//! 工作池：入站消息、自主建议、调度执行共用
//!
//! 用 Semaphore 限制同时运行的作业数；每个作业拿到根 token 的子 token，关闭时统一取消。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// 作业类型（仅用于日志）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum JobKind {
    /// 处理一条入站消息
    Message,
    /// 自主建议任务
    Suggest,
    /// 调度与执行回报
    Tick,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Message => "message",
            JobKind::Suggest => "suggest",
            JobKind::Tick => "tick",
        }
    }
}

/// 作业 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    root: CancellationToken,
    jobs: tokio::sync::Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, root: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            root,
            jobs: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.root
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 提交作业；等到有空闲许可才开始执行。关闭后提交的作业直接丢弃
    pub async fn spawn<F, Fut>(&self, kind: JobKind, job: F) -> Option<JobId>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            tracing::debug!(kind = kind.as_str(), "worker pool closed, job dropped");
            return None;
        }
        let id = JobId::next();
        let permits = Arc::clone(&self.permits);
        let token = self.root.child_token();
        let mut jobs = self.jobs.lock().await;
        // 清理已结束的作业
        while jobs.try_join_next().is_some() {}
        jobs.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => return,
                p = permits.acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            tracing::debug!(job = id.0, kind = kind.as_str(), "job started");
            job(token).await;
            tracing::debug!(job = id.0, kind = kind.as_str(), "job finished");
        });
        Some(id)
    }

    /// 取消所有作业，并在超时内等待它们结束
    pub async fn shutdown(&self, timeout: Duration) {
        self.root.cancel();
        self.permits.close();
        self.drain(timeout).await;
    }

    /// 等待已提交的作业结束（不取消）
    pub async fn drain(&self, timeout: Duration) {
        let mut jobs = self.jobs.lock().await;
        let pending = jobs.len();
        let wait = async {
            while let Some(res) = jobs.join_next().await {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "worker job panicked");
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            tracing::warn!(pending, "worker pool drain timed out, aborting remaining jobs");
            jobs.abort_all();
        }
    }
}
