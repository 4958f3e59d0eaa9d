//! 记忆层：工作记忆（环形缓冲）、长期记忆（记录存储）、统一的 MemoryManager

pub mod entry;
pub mod long_term;
pub mod manager;
pub mod working;

pub use entry::{cosine_similarity, MemoryEntry, MemoryQuery, TimeRange, WorkingSnapshot};
pub use long_term::{rank_entries, LongTermMemory, NoopLongTerm, StoreLongTerm};
pub use manager::MemoryManager;
pub use working::WorkingMemory;
