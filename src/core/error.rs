//! 核心错误类型
//!
//! 存储层、图谱层、编排层共用一套错误分类：校验失败不触碰存储，
//! BackendUnavailable 触发短期记忆降级，Generation / DeadlineExceeded 由编排引擎决定是否致命。

use thiserror::Error;

/// 记忆、图谱与编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// 身份、标签或必填字段不合法；返回前不会写入任何存储
    #[error("Validation error: {0}")]
    Validation(String),

    /// 实体类型 / 关系类型不符合 `^[A-Za-z][A-Za-z0-9_]*$`
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 存储连接失败（短期记忆会降级到进程内存储）
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 任务被取消或 panic（JoinError）
    #[error("Task aborted: {0}")]
    TaskAborted(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// 是否为可以安全展示给终端用户的错误（仅输入校验类）
    pub fn is_user_facing(&self) -> bool {
        matches!(self, CoreError::Validation(_) | CoreError::InvalidLabel(_))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::CannotOpen
                        | ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::NotADatabase
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                CoreError::BackendUnavailable(e.to_string())
            }
            _ => CoreError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failure_maps_to_backend_unavailable() {
        let err = rusqlite::Connection::open("/nonexistent-dir/for/sure/db.sqlite")
            .map_err(CoreError::from)
            .unwrap_err();
        assert!(matches!(err, CoreError::BackendUnavailable(_)), "{err:?}");
    }

    #[test]
    fn test_user_facing_errors() {
        assert!(CoreError::Validation("empty".into()).is_user_facing());
        assert!(!CoreError::Storage("disk".into()).is_user_facing());
    }
}
