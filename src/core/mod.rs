//! 核心层：错误分类、工作池、优雅关闭、组件装配

pub mod builder;
pub mod error;
pub mod shutdown;
pub mod worker_pool;

pub use builder::{create_agent_builder, AgentBuilder};
pub use error::AgentError;
pub use shutdown::{
    ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, WorkerPoolCleanup,
    WorkingMemoryCleanup,
};
pub use worker_pool::{JobId, JobKind, WorkerPool};
