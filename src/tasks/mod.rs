//! 任务层：数据模型、存储视图、审批治理、生命周期管理

pub mod governance;
pub mod manager;
pub mod model;
pub mod store;

pub use governance::{decide, ApprovalDecision, Governance, Tally, TicketId};
pub use manager::{DeferReason, SchedulePass, TaskFilter, TaskManager, TransitionOutcome};
pub use model::{
    metrics_eligible, Action, AuditEntry, Metric, Task, TaskId, TaskSettings, TaskStatus,
};
pub use store::TaskStore;
