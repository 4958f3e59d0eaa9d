//! Tessera - Rust 自主智能体运行时
//!
//! 入口：初始化日志、按配置装配 Agent，从 stdin 逐行读取消息（`sender: text`）投递到工作池，
//! 定时执行调度与自主建议；收到 Ctrl+C / SIGTERM 或输入结束后优雅关闭。
//!
//! 运维命令：`/tasks` 列出任务，`/vote <task_id> <stakeholder> approve|reject` 投票，
//! `/supersede <task_id> <reason>` 以新计划取代尚未激活的任务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tessera::core::{
    create_agent_builder, JobKind, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    WorkerPool, WorkerPoolCleanup, WorkingMemoryCleanup,
};
use tessera::tasks::TaskFilter;
use tessera::{Agent, IncomingMessage};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tessera::observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let builder = create_agent_builder(config_path);
    let workers = builder.config().workers.clone();
    let agent = Arc::new(builder.build().context("Failed to build agent")?);
    if let Err(e) = agent.restore().await {
        tracing::warn!(error = %e, "restore failed, starting from empty state");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let pool = Arc::new(WorkerPool::new(workers.size, shutdown.token()));

    spawn_ticker(Arc::clone(&agent), Arc::clone(&pool), workers.tick_interval_secs, JobKind::Tick);
    spawn_ticker(Arc::clone(&agent), Arc::clone(&pool), workers.suggest_interval_secs, JobKind::Suggest);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            // 输入结束：等正在处理的消息完成后再关闭
            pool.drain(Duration::from_secs(120)).await;
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            run_command(&agent, &line).await;
            continue;
        }

        let msg = parse_line(&line);
        let agent = Arc::clone(&agent);
        pool.spawn(JobKind::Message, move |cancel| async move {
            let sender = msg.sender.clone();
            match agent.handle_message(msg, &cancel).await {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        println!("[{}] {}", agent.character().name, reply);
                    }
                    if let Some(task) = outcome.planned_task {
                        println!("  planned task {} ({}) with {} actions", task.id, task.name, task.actions.len());
                    }
                }
                Err(e) => tracing::error!(error = %e, sender = %sender, "message handling failed"),
            }
        })
        .await;
    }

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(10);
    coordinator.register(WorkerPoolCleanup::new(Arc::clone(&pool), Duration::from_secs(5)));
    coordinator.register(WorkingMemoryCleanup::new(Arc::clone(agent.memory())));
    coordinator.run_cleanup().await;
    Ok(())
}

/// `sender: text`；没有前缀时发送者记为 user
fn parse_line(line: &str) -> IncomingMessage {
    match line.split_once(':') {
        Some((sender, text)) if !sender.trim().is_empty() && !sender.contains(' ') => {
            IncomingMessage::new(sender.trim(), text.trim())
        }
        _ => IncomingMessage::new("user", line),
    }
}

fn spawn_ticker(agent: Arc<Agent>, pool: Arc<WorkerPool>, secs: u64, kind: JobKind) {
    if secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = pool.token().cancelled() => break,
                _ = interval.tick() => {}
            }
            let agent = Arc::clone(&agent);
            pool.spawn(kind, move |cancel| async move {
                let result = match kind {
                    JobKind::Suggest => agent.self_suggest(&cancel).await.map(|_| ()),
                    _ => agent.tick(&cancel).await.map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, job = kind.as_str(), "periodic job failed");
                }
            })
            .await;
        }
    });
}

async fn run_command(agent: &Agent, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["/tasks"] => match agent.tasks().list_tasks(&TaskFilter::all()).await {
            Ok(tasks) => {
                for t in tasks {
                    println!("{} [{}] p={} {} ({})", t.id, t.status, t.priority, t.name, t.created_by);
                }
            }
            Err(e) => println!("error: {e}"),
        },
        ["/vote", task_id, stakeholder, choice] => {
            let weight = agent.tasks().governance().stakeholders().get(*stakeholder).copied();
            let Some(weight) = weight else {
                println!("error: unknown stakeholder {stakeholder}");
                return;
            };
            let approve = matches!(*choice, "approve" | "yes" | "y");
            match agent.tasks().vote(task_id, stakeholder, weight, approve).await {
                Ok(decision) => println!("vote recorded, ticket is now {decision:?}"),
                Err(e) => println!("error: {e}"),
            }
        }
        ["/supersede", task_id, reason @ ..] if !reason.is_empty() => {
            match agent.tasks().supersede(task_id, &reason.join(" ")).await {
                Ok(_) => println!("task {task_id} superseded"),
                Err(e) => println!("error: {e}"),
            }
        }
        _ => println!(
            "commands: /tasks | /vote <task_id> <stakeholder> approve|reject | /supersede <task_id> <reason>"
        ),
    }
}
