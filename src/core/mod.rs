//! 核心：错误分类、SQLite 辅助

pub mod error;
pub(crate) mod sql;

pub use error::{CoreError, Result};
