//! 记忆层：Turn 模型、短期（有界 + TTL）、长期（按重要性写入）、协调器

pub mod coordinator;
pub mod long_term;
pub mod short_term;
pub mod turn;

pub use coordinator::{HistoryImport, MemoryCoordinator, MemoryStats};
pub use long_term::{LongTermStore, OrderBy, SqliteLongTerm};
pub use short_term::{
    InMemoryShortTerm, ShortTermBackend, ShortTermPolicy, ShortTermStore, SqliteShortTerm,
};
pub use turn::{Role, Turn};
