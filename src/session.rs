//! 会话存储
//!
//! 会话令牌 -> (user_id, session_id) 的映射，带过期时间。
//! 以 trait 注入到 Agent：测试用内存实现，生产用 SQLite 实现。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SessionSection;
use crate::core::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn new(user_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            session_id: format!("sess_{}", Uuid::new_v4()),
            created_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(CoreError::Validation("user_id must not be empty".into()));
    }
    Ok(())
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 为用户签发新会话
    async fn create(&self, user_id: &str) -> Result<Session>;

    /// 查找未过期的会话；过期会话视为不存在
    async fn resolve(&self, token: &str) -> Result<Option<Session>>;

    /// 从当前时间起重新计算过期时间
    async fn touch(&self, token: &str) -> Result<bool>;

    async fn revoke(&self, token: &str) -> Result<bool>;

    /// 删除全部过期会话，返回删除数量
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// 内存会话存储
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str) -> Result<Session> {
        validate_user(user_id)?;
        let session = Session::new(user_id, self.ttl);
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        tracing::debug!(user_id, session_id = %session.session_id, "session created");
        Ok(session)
    }

    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(token)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned())
    }

    async fn touch(&self, token: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        match sessions.get_mut(token) {
            Some(s) if !s.is_expired(now) => {
                s.expires_at = expiry(now, self.ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, token: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(token).is_some())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let now = Utc::now();
        sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, "expired sessions cleaned up");
        }
        Ok(removed)
    }
}

/// SQLite 会话存储
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::BackendUnavailable(format!("{}: {e}", parent.display())))?;
        }
        tracing::info!(path = %path.display(), "opening session store");
        Self::init(Connection::open(path)?, ttl)
    }

    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ttl)
    }

    fn init(conn: Connection, ttl: Duration) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }
}

fn micros_to_time(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| CoreError::Storage(format!("corrupt timestamp {micros}")))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, user_id: &str) -> Result<Session> {
        validate_user(user_id)?;
        let session = Session::new(user_id, self.ttl);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (token, user_id, session_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.token,
                session.user_id,
                session.session_id,
                session.created_at.timestamp_micros(),
                session.expires_at.timestamp_micros(),
            ],
        )?;
        tracing::debug!(user_id, session_id = %session.session_id, "session created");
        Ok(session)
    }

    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT token, user_id, session_id, created_at, expires_at
                 FROM sessions WHERE token = ?1 AND expires_at > ?2",
                params![token, Utc::now().timestamp_micros()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(token, user_id, session_id, created, expires)| {
            Ok(Session {
                token,
                user_id,
                session_id,
                created_at: micros_to_time(created)?,
                expires_at: micros_to_time(expires)?,
            })
        })
        .transpose()
    }

    async fn touch(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE sessions SET expires_at = ?1 WHERE token = ?2 AND expires_at > ?3",
            params![
                expiry(now, self.ttl).timestamp_micros(),
                token,
                now.timestamp_micros()
            ],
        )?;
        Ok(updated > 0)
    }

    async fn revoke(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])? > 0)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![Utc::now().timestamp_micros()],
        )?;
        if removed > 0 {
            tracing::info!(removed, "expired sessions cleaned up");
        }
        Ok(removed)
    }
}

/// 按配置创建会话存储；SQLite 打不开时回退到内存实现
pub fn create_session_store(cfg: &SessionSection) -> Arc<dyn SessionStore> {
    let ttl = Duration::from_secs(cfg.ttl_secs);
    match &cfg.db_path {
        Some(path) => match SqliteSessionStore::open(path, ttl) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "session database unavailable, sessions will not survive restarts");
                Arc::new(InMemorySessionStore::new(ttl))
            }
        },
        None => Arc::new(InMemorySessionStore::new(ttl)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn SessionStore) {
        let session = store.create("alice").await.unwrap();
        assert!(session.session_id.starts_with("sess_"));
        let resolved = store.resolve(&session.token).await.unwrap().unwrap();
        assert_eq!(resolved.user_id, "alice");
        assert_eq!(resolved.session_id, session.session_id);

        assert!(store.touch(&session.token).await.unwrap());
        assert!(store.resolve("no-such-token").await.unwrap().is_none());

        assert!(store.revoke(&session.token).await.unwrap());
        assert!(!store.revoke(&session.token).await.unwrap());
        assert!(store.resolve(&session.token).await.unwrap().is_none());
        assert!(matches!(store.create(" ").await, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_in_memory_sessions() {
        exercise(&InMemorySessionStore::new(Duration::from_secs(60))).await;
    }

    #[tokio::test]
    async fn test_sqlite_sessions() {
        exercise(&SqliteSessionStore::open_in_memory(Duration::from_secs(60)).unwrap()).await;
    }

    #[tokio::test]
    async fn test_expired_sessions() {
        let stores: Vec<Box<dyn SessionStore>> = vec![
            Box::new(InMemorySessionStore::new(Duration::ZERO)),
            Box::new(SqliteSessionStore::open_in_memory(Duration::ZERO).unwrap()),
        ];
        for store in stores {
            let session = store.create("bob").await.unwrap();
            assert!(store.resolve(&session.token).await.unwrap().is_none());
            assert!(!store.touch(&session.token).await.unwrap());
            assert_eq!(store.cleanup_expired().await.unwrap(), 1);
            assert_eq!(store.cleanup_expired().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let token = {
            let store = SqliteSessionStore::open(&path, Duration::from_secs(60)).unwrap();
            store.create("carol").await.unwrap().token
        };
        let store = SqliteSessionStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(store.resolve(&token).await.unwrap().unwrap().user_id, "carol");
    }

    #[test]
    fn test_store_from_config() {
        let cfg = SessionSection {
            ttl_secs: 60,
            db_path: Some("/proc/definitely/not/writable/sessions.db".into()),
        };
        // 回退到内存实现
        let _store = create_session_store(&cfg);
    }
}
