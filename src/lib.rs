//! Tessera - Rust 自主智能体运行时
//!
//! 模块划分：
//! - **agent**: 消息回合编排（分类 → 审议 → 任务）、自主建议与执行回报
//! - **character**: 角色档案加载（TOML / JSON），拼入 system prompt
//! - **classifier**: 消息分类（意图 / 实体 / 情绪 / 置信度 / 是否生成动作）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、工作池、优雅关闭、组件构建
//! - **datasource**: 只读外部数据源（代币余额、指标），失败时降级
//! - **deliberation**: 五阶段审议流水线（生成 → 评估 → 重新考虑 → 精炼 → 定稿）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 重试包装 / 嵌入）
//! - **memory**: 工作记忆（环形缓冲）、长期记忆、MemoryManager
//! - **store**: 类型化记录存储（内存 / SQLite）
//! - **tasks**: 任务模型、生命周期状态机、审批治理、任务管理器
//! - **tools**: 外部工具描述目录（动作类型 / 动作名）

pub mod agent;
pub mod character;
pub mod classifier;
pub mod config;
pub mod core;
pub mod datasource;
pub mod deliberation;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod store;
pub mod tasks;
pub mod tools;

pub use agent::{Agent, IncomingMessage, TaskExecutor, TurnOutcome};
pub use core::{AgentBuilder, AgentError};
