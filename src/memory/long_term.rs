//! 长期记忆：按用户持久化的 Turn 日志，带重要性分数
//!
//! - 只由协调器在 importance_score >= 阈值时写入，不按容量淘汰
//! - 用户记录在首次写入时与 Turn 在同一事务中创建，读取不会创建用户
//! - 存储键为 (user_id, entry_id)，entry_id 即 Turn id，重复写入同一条目只更新分数

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::turn::{clamp_score, Role, Turn};
use crate::core::sql::{contains_pattern, register_unicode_lower};
use crate::core::{CoreError, Result};

/// 长期记忆排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    /// 取最近 limit 条，按时间升序返回
    #[default]
    Recency,
    /// 按分数降序，同分按时间降序
    Importance,
}

/// 长期记忆 trait
#[async_trait]
pub trait LongTermStore: Send + Sync {
    async fn add(&self, user_id: &str, turn: &Turn, importance_score: f32) -> Result<()>;

    async fn get(&self, user_id: &str, limit: usize, order_by: OrderBy) -> Result<Vec<Turn>>;

    /// 内容子串匹配（不区分大小写），最新在前
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Turn>>;

    async fn update_importance(&self, entry_id: Uuid, score: f32) -> Result<()>;

    /// entry_id 为 None 时删除该用户全部条目，返回删除条数
    async fn delete(&self, user_id: &str, entry_id: Option<Uuid>) -> Result<usize>;

    /// 按最近活跃时间降序
    async fn list_users(&self) -> Result<Vec<String>>;

    async fn count(&self, user_id: &str) -> Result<usize>;
}

/// SQLite 实现
pub struct SqliteLongTerm {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLongTerm {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::BackendUnavailable(format!("{}: {e}", parent.display())))?;
        }
        tracing::info!(path = %path.display(), "opening long-term store");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        register_unicode_lower(&conn)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS long_term_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                entry_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                timestamp INTEGER NOT NULL,
                importance_score REAL NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, entry_id)
            );

            CREATE INDEX IF NOT EXISTS idx_ltm_user_ts ON long_term_memory(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_ltm_entry ON long_term_memory(entry_id);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

const TURN_COLUMNS: &str = "entry_id, role, content, metadata, timestamp, importance_score";

/// 数据库行的原始形态，转换为 Turn 时再做校验
struct TurnRow {
    entry_id: String,
    role: String,
    content: String,
    metadata: String,
    timestamp: i64,
    importance_score: f64,
}

impl TurnRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entry_id: row.get(0)?,
            role: row.get(1)?,
            content: row.get(2)?,
            metadata: row.get(3)?,
            timestamp: row.get(4)?,
            importance_score: row.get(5)?,
        })
    }

    fn into_turn(self) -> Result<Turn> {
        let id = Uuid::parse_str(&self.entry_id)
            .map_err(|e| CoreError::Storage(format!("corrupt entry id {}: {e}", self.entry_id)))?;
        let timestamp = DateTime::<Utc>::from_timestamp_micros(self.timestamp)
            .ok_or_else(|| CoreError::Storage(format!("corrupt timestamp {}", self.timestamp)))?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)?;
        Ok(Turn {
            id,
            role: Role::parse(&self.role)?,
            content: self.content,
            timestamp,
            importance_score: self.importance_score as f32,
            metadata,
        })
    }
}

fn query_turns(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, TurnRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(TurnRow::into_turn).collect()
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(CoreError::Validation("user_id must not be empty".into()));
    }
    Ok(())
}

fn validate_score(score: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&score) {
        return Err(CoreError::Validation(format!(
            "importance score {score} outside [0, 1]"
        )));
    }
    Ok(clamp_score(score))
}

fn insert_turn(conn: &mut Connection, user_id: &str, turn: &Turn, score: f32) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO users (user_id, created_at, last_updated) VALUES (?1, ?2, ?2)
         ON CONFLICT(user_id) DO UPDATE SET last_updated = excluded.last_updated",
        params![user_id, now],
    )?;
    tx.execute(
        "INSERT INTO long_term_memory
            (user_id, entry_id, role, content, metadata, timestamp, importance_score, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, entry_id) DO UPDATE SET importance_score = excluded.importance_score",
        params![
            user_id,
            turn.id.to_string(),
            turn.role.as_str(),
            turn.content,
            serde_json::to_string(&turn.metadata)?,
            turn.timestamp.timestamp_micros(),
            score as f64,
            now,
        ],
    )?;
    tx.commit()?;
    Ok(())
}

impl SqliteLongTerm {
    /// 持锁后在阻塞线程池上执行同步 SQLite 操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let mut conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *conn))
            .await
            .map_err(|e| CoreError::TaskAborted(format!("long-term store operation: {e}")))?
    }
}

#[async_trait]
impl LongTermStore for SqliteLongTerm {
    async fn add(&self, user_id: &str, turn: &Turn, importance_score: f32) -> Result<()> {
        validate_user(user_id)?;
        let score = validate_score(importance_score)?;
        let (owner, entry) = (user_id.to_string(), turn.clone());
        self.with_conn(move |conn| insert_turn(conn, &owner, &entry, score))
            .await?;
        tracing::debug!(user_id, entry_id = %turn.id, score, "long-term entry written");
        Ok(())
    }

    async fn get(&self, user_id: &str, limit: usize, order_by: OrderBy) -> Result<Vec<Turn>> {
        let user_id = user_id.to_string();
        let limit = limit as i64;
        self.with_conn(move |conn| match order_by {
            OrderBy::Recency => {
                let mut turns = query_turns(
                    conn,
                    &format!(
                        "SELECT {TURN_COLUMNS} FROM long_term_memory WHERE user_id = ?1
                         ORDER BY timestamp DESC, id DESC LIMIT ?2"
                    ),
                    params![user_id, limit],
                )?;
                turns.reverse();
                Ok(turns)
            }
            OrderBy::Importance => query_turns(
                conn,
                &format!(
                    "SELECT {TURN_COLUMNS} FROM long_term_memory WHERE user_id = ?1
                     ORDER BY importance_score DESC, timestamp DESC, id DESC LIMIT ?2"
                ),
                params![user_id, limit],
            ),
        })
        .await
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Turn>> {
        let user_id = user_id.to_string();
        let pattern = contains_pattern(query);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            query_turns(
                conn,
                &format!(
                    "SELECT {TURN_COLUMNS} FROM long_term_memory
                     WHERE user_id = ?1 AND unicode_lower(content) LIKE ?2 ESCAPE '\\'
                     ORDER BY timestamp DESC, id DESC LIMIT ?3"
                ),
                params![user_id, pattern, limit],
            )
        })
        .await
    }

    async fn update_importance(&self, entry_id: Uuid, score: f32) -> Result<()> {
        let score = validate_score(score)?;
        let updated = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE long_term_memory SET importance_score = ?1 WHERE entry_id = ?2",
                    params![score as f64, entry_id.to_string()],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!("long-term entry {entry_id}")));
        }
        Ok(())
    }

    async fn delete(&self, user_id: &str, entry_id: Option<Uuid>) -> Result<usize> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let deleted = match entry_id {
                Some(id) => conn.execute(
                    "DELETE FROM long_term_memory WHERE user_id = ?1 AND entry_id = ?2",
                    params![user_id, id.to_string()],
                )?,
                None => conn.execute(
                    "DELETE FROM long_term_memory WHERE user_id = ?1",
                    params![user_id],
                )?,
            };
            Ok(deleted)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM users ORDER BY last_updated DESC, user_id")?;
            let users = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn count(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM long_term_memory WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn turn_at(content: &str, secs: i64) -> Turn {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        Turn::user(content).with_timestamp(base + Duration::seconds(secs))
    }

    fn contents(turns: &[Turn]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_recency_returns_latest_window_ascending() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        for (i, c) in ["a", "b", "c", "d"].iter().enumerate() {
            store.add("u1", &turn_at(c, i as i64), 0.6).await.unwrap();
        }
        let turns = store.get("u1", 2, OrderBy::Recency).await.unwrap();
        assert_eq!(contents(&turns), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_importance_order_with_recency_tiebreak() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        store.add("u1", &turn_at("low", 0), 0.5).await.unwrap();
        store.add("u1", &turn_at("high-old", 1), 0.9).await.unwrap();
        store.add("u1", &turn_at("high-new", 2), 0.9).await.unwrap();
        store.add("u1", &turn_at("mid", 3), 0.7).await.unwrap();

        let turns = store.get("u1", 10, OrderBy::Importance).await.unwrap();
        assert_eq!(contents(&turns), vec!["high-new", "high-old", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_user_created_lazily_on_write_only() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        assert!(store.get("ghost", 5, OrderBy::Recency).await.unwrap().is_empty());
        assert!(store.list_users().await.unwrap().is_empty());

        store.add("alice", &Turn::user("I like cats"), 0.7).await.unwrap();
        assert_eq!(store.list_users().await.unwrap(), vec!["alice"]);
        assert_eq!(store.count("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rewrite_same_entry_is_idempotent() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        let turn = Turn::user("remember me");
        store.add("u1", &turn, 0.6).await.unwrap();
        store.add("u1", &turn, 0.8).await.unwrap();
        let turns = store.get("u1", 10, OrderBy::Recency).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert!((turns[0].importance_score - 0.8).abs() < 1e-6);
        assert_eq!(turns[0].id, turn.id);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_escaped() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        store.add("u1", &turn_at("I like Cats", 0), 0.6).await.unwrap();
        store.add("u1", &turn_at("cats are 100% great", 1), 0.6).await.unwrap();
        store.add("u1", &turn_at("dogs", 2), 0.6).await.unwrap();
        store.add("u2", &turn_at("cats elsewhere", 3), 0.6).await.unwrap();

        let hits = store.search("u1", "CATS", 10).await.unwrap();
        assert_eq!(contents(&hits), vec!["cats are 100% great", "I like Cats"]);

        let hits = store.search("u1", "100%", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = store.search("u1", "_", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_folds_non_ascii_case() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        store.add("u1", &turn_at("Über cats", 0), 0.6).await.unwrap();
        store.add("u1", &turn_at("ÇA VA bien", 1), 0.6).await.unwrap();

        assert_eq!(contents(&store.search("u1", "über", 10).await.unwrap()), vec!["Über cats"]);
        assert_eq!(contents(&store.search("u1", "ça va", 10).await.unwrap()), vec!["ÇA VA bien"]);
        assert!(store.search("u1", "uber", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_importance_and_delete() {
        let store = SqliteLongTerm::open_in_memory().unwrap();
        let keep = turn_at("keep", 0);
        let drop = turn_at("drop", 1);
        store.add("u1", &keep, 0.5).await.unwrap();
        store.add("u1", &drop, 0.5).await.unwrap();

        store.update_importance(keep.id, 0.95).await.unwrap();
        let top = store.get("u1", 1, OrderBy::Importance).await.unwrap();
        assert_eq!(top[0].id, keep.id);

        assert!(matches!(
            store.update_importance(Uuid::new_v4(), 0.3).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_importance(keep.id, 1.5).await,
            Err(CoreError::Validation(_))
        ));

        assert_eq!(store.delete("u1", Some(drop.id)).await.unwrap(), 1);
        assert_eq!(store.count("u1").await.unwrap(), 1);
        assert_eq!(store.delete("u1", None).await.unwrap(), 1);
        assert_eq!(store.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ltm.db");
        let turn = Turn::assistant("durable").with_metadata("session_id", "s1");
        {
            let store = SqliteLongTerm::open(&path).unwrap();
            store.add("u1", &turn, 0.75).await.unwrap();
        }
        let store = SqliteLongTerm::open(&path).unwrap();
        let turns = store.get("u1", 10, OrderBy::Recency).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].id, turn.id);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(turns[0].metadata["session_id"], "s1");
        assert_eq!(turns[0].timestamp.timestamp_micros(), turn.timestamp.timestamp_micros());
    }
}
