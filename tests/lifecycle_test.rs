//! 任务生命周期集成测试：并发激活上限、SQLite 持久化与重启恢复

use std::sync::Arc;

use tessera::memory::{MemoryManager, NoopLongTerm, StoreLongTerm};
use tessera::store::{RecordStore, SqliteStore};
use tessera::tasks::{
    DeferReason, Governance, Task, TaskFilter, TaskManager, TaskSettings, TaskStatus, TaskStore,
    TransitionOutcome,
};
use tessera::tools::{ToolCatalog, ToolDescriptor};

fn manager_over(store: Arc<dyn RecordStore>, max_concurrent: usize) -> Arc<TaskManager> {
    let memory = Arc::new(MemoryManager::new(
        16,
        Arc::new(StoreLongTerm::new(Arc::clone(&store))),
    ));
    let catalog = Arc::new(ToolCatalog::new().with(ToolDescriptor::new("twitter", "post_tweet", "Post a tweet")));
    let settings = TaskSettings {
        max_concurrent,
        ..TaskSettings::default()
    };
    Arc::new(TaskManager::new(
        TaskStore::new(store),
        Arc::new(Governance::new(0.5)),
        memory,
        catalog,
        settings,
    ))
}

fn task(name: &str) -> Task {
    Task::new(name, "lifecycle")
        .with_steps(["draft", "publish"])
        .with_tools(["twitter"])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activation_never_exceeds_bound() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(dir.path().join("tasks.db")).unwrap());
    let manager = manager_over(store, 2);

    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(manager.add_task(task(&format!("task {i}"))).await.unwrap().id);
    }

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.transition(&id, TaskStatus::Active, "race").await })
        })
        .collect();

    let mut applied = 0;
    let mut saturated = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            TransitionOutcome::Applied(_) => applied += 1,
            TransitionOutcome::Deferred(DeferReason::Saturated) => saturated += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(applied, 2);
    assert_eq!(saturated, 6);
    assert_eq!(manager.active_count(), 2);

    let active = manager
        .list_tasks(&TaskFilter::all().with_status(TaskStatus::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    // 释放一个槽位后可以再激活一个
    manager.report_completion(&active[0].id).await.unwrap();
    let pass = manager.schedule_pass().await.unwrap();
    assert_eq!(pass.activated.len(), 1);
    assert_eq!(manager.active_count(), 2);
}

#[tokio::test]
async fn test_restart_releases_interrupted_tasks_and_reopens_tickets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");

    let (active_id, gated_id) = {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let manager = manager_over(store, 3);
        let active = manager.add_task(task("ship")).await.unwrap();
        manager
            .transition(&active.id, TaskStatus::Active, "start")
            .await
            .unwrap();
        let gated = manager
            .add_task(task("payout").with_approval(true))
            .await
            .unwrap();
        (active.id, gated.id)
    };

    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let manager = manager_over(store, 3);
    manager.governance().register_stakeholder("carol", 1.0).unwrap();
    // 重启前在执行中的任务没有执行方回报，转为 Failed 并释放名额
    assert_eq!(manager.restore().await.unwrap(), 1);
    assert_eq!(manager.get_task(&active_id).await.unwrap().status, TaskStatus::Failed);
    assert_eq!(manager.active_count(), 0);

    // 审批票据只在内存中，重启后重新开票
    let gated = manager.get_task(&gated_id).await.unwrap();
    assert!(gated.approval_ticket.is_some());
    let outcome = manager.transition(&gated_id, TaskStatus::Active, "start").await.unwrap();
    assert!(matches!(outcome, TransitionOutcome::Deferred(DeferReason::AwaitingApproval)));
}

#[tokio::test]
async fn test_terminal_tasks_stay_terminal() {
    let store: Arc<dyn RecordStore> = Arc::new(tessera::store::InMemoryStore::new());
    let memory = Arc::new(MemoryManager::new(4, Arc::new(NoopLongTerm)));
    let manager = TaskManager::new(
        TaskStore::new(store),
        Arc::new(Governance::new(0.5)),
        memory,
        Arc::new(ToolCatalog::new()),
        TaskSettings::default(),
    );
    let t = manager
        .add_task(Task::new("one-off", "x").with_steps(["do it"]))
        .await
        .unwrap();
    manager.transition(&t.id, TaskStatus::Active, "start").await.unwrap();
    manager.report_completion(&t.id).await.unwrap();

    for to in TaskStatus::ALL {
        assert!(manager.transition(&t.id, to, "again").await.is_err());
    }
    assert_eq!(manager.get_task(&t.id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_interrupted_task_does_not_block_single_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");

    {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let manager = manager_over(store, 1);
        let running = manager.add_task(task("in flight")).await.unwrap();
        manager
            .transition(&running.id, TaskStatus::Active, "start")
            .await
            .unwrap();
    }

    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let manager = manager_over(store, 1);
    manager.restore().await.unwrap();
    let next = manager.add_task(task("after restart")).await.unwrap();

    let pass = manager.schedule_pass().await.unwrap();
    assert_eq!(pass.activated.len(), 1);
    assert_eq!(manager.get_task(&next.id).await.unwrap().status, TaskStatus::Active);
    assert_eq!(manager.active_count(), 1);
}
