//! 短期记忆：按用户保存最近 N 条 Turn，整键 TTL
//!
//! - 每次写入后若超过容量则从头部截断（FIFO）
//! - 每次写入重置整键过期时间；过期后读取与从未写入无区别（返回空）
//! - 主后端不可用时 [`ShortTermStore`] 切换到进程内存储，并通过 `fallback_active` 与 warn 日志暴露

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::turn::Turn;
use crate::core::{CoreError, Result};

/// 短期记忆的容量与过期策略
#[derive(Debug, Clone, Copy)]
pub struct ShortTermPolicy {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for ShortTermPolicy {
    fn default() -> Self {
        Self {
            capacity: 10,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// 短期记忆后端
#[async_trait]
pub trait ShortTermBackend: Send + Sync {
    /// 整体覆盖用户的 Turn 列表（超出容量时只保留最新部分）
    async fn store(&self, user_id: &str, turns: Vec<Turn>) -> Result<()>;

    async fn get(&self, user_id: &str) -> Result<Vec<Turn>>;

    async fn append(&self, user_id: &str, turn: Turn) -> Result<()>;

    /// 删除用户短期记忆，返回是否存在
    async fn delete(&self, user_id: &str) -> Result<bool>;

    async fn list_users(&self) -> Result<Vec<String>>;

    /// 刷新过期时间；键不存在或已过期时返回 false
    async fn refresh_ttl(&self, user_id: &str, ttl: Option<Duration>) -> Result<bool>;

    fn backend_name(&self) -> &'static str;
}

fn keep_latest(turns: &mut Vec<Turn>, capacity: usize) {
    if turns.len() > capacity {
        let excess = turns.len() - capacity;
        turns.drain(..excess);
    }
}

struct Slot {
    turns: Vec<Turn>,
    expires_at: Instant,
}

/// 进程内后端（tokio 时钟，测试中可 pause / advance）
pub struct InMemoryShortTerm {
    policy: ShortTermPolicy,
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemoryShortTerm {
    pub fn new(policy: ShortTermPolicy) -> Self {
        Self {
            policy,
            slots: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ShortTermBackend for InMemoryShortTerm {
    async fn store(&self, user_id: &str, mut turns: Vec<Turn>) -> Result<()> {
        keep_latest(&mut turns, self.policy.capacity);
        let mut slots = self.slots.write().await;
        slots.insert(
            user_id.to_string(),
            Slot {
                turns,
                expires_at: Instant::now() + self.policy.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Vec<Turn>> {
        let slots = self.slots.read().await;
        Ok(match slots.get(user_id) {
            Some(slot) if slot.expires_at > Instant::now() => slot.turns.clone(),
            _ => Vec::new(),
        })
    }

    async fn append(&self, user_id: &str, turn: Turn) -> Result<()> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let slot = slots.entry(user_id.to_string()).or_insert_with(|| Slot {
            turns: Vec::new(),
            expires_at: now,
        });
        if slot.expires_at <= now {
            slot.turns.clear();
        }
        slot.turns.push(turn);
        keep_latest(&mut slot.turns, self.policy.capacity);
        slot.expires_at = now + self.policy.ttl;
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        let mut slots = self.slots.write().await;
        Ok(match slots.remove(user_id) {
            Some(slot) => slot.expires_at > Instant::now(),
            None => false,
        })
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| slot.expires_at > now);
        let mut users: Vec<String> = slots.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    async fn refresh_ttl(&self, user_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        match slots.get_mut(user_id) {
            Some(slot) if slot.expires_at > now => {
                slot.expires_at = now + ttl.unwrap_or(self.policy.ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// SQLite 后端：每个用户一行，turns 以 JSON 数组存储，expires_at 为 Unix 毫秒
pub struct SqliteShortTerm {
    policy: ShortTermPolicy,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteShortTerm {
    pub fn open(path: impl AsRef<Path>, policy: ShortTermPolicy) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::BackendUnavailable(format!("{}: {e}", parent.display())))?;
        }
        tracing::info!(path = %path.display(), "opening short-term store");
        Self::init(Connection::open(path)?, policy)
    }

    pub fn open_in_memory(policy: ShortTermPolicy) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, policy)
    }

    fn init(conn: Connection, policy: ShortTermPolicy) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS short_term_memory (
                user_id TEXT PRIMARY KEY,
                turns_json TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            policy,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 持锁后在阻塞线程池上执行同步 SQLite 操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let mut conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *conn))
            .await
            .map_err(|e| CoreError::TaskAborted(format!("short-term store operation: {e}")))?
    }

    fn expiry_from_now(ttl: Duration) -> i64 {
        now_millis() + ttl.as_millis() as i64
    }

    fn load_live(conn: &Connection, user_id: &str) -> Result<Vec<Turn>> {
        let row: Option<String> = conn
            .query_row(
                "SELECT turns_json FROM short_term_memory WHERE user_id = ?1 AND expires_at > ?2",
                params![user_id, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(conn: &Connection, user_id: &str, turns: &[Turn], ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(turns)?;
        conn.execute(
            "INSERT INTO short_term_memory (user_id, turns_json, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                turns_json = excluded.turns_json,
                expires_at = excluded.expires_at",
            params![user_id, json, Self::expiry_from_now(ttl)],
        )?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ShortTermBackend for SqliteShortTerm {
    async fn store(&self, user_id: &str, mut turns: Vec<Turn>) -> Result<()> {
        keep_latest(&mut turns, self.policy.capacity);
        let (user_id, ttl) = (user_id.to_string(), self.policy.ttl);
        self.with_conn(move |conn| Self::save(conn, &user_id, &turns, ttl))
            .await
    }

    async fn get(&self, user_id: &str) -> Result<Vec<Turn>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| Self::load_live(conn, &user_id))
            .await
    }

    async fn append(&self, user_id: &str, turn: Turn) -> Result<()> {
        let (user_id, policy) = (user_id.to_string(), self.policy);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut turns = Self::load_live(&tx, &user_id)?;
            turns.push(turn);
            keep_latest(&mut turns, policy.capacity);
            Self::save(&tx, &user_id, &turns, policy.ttl)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let live = conn
                .query_row(
                    "SELECT 1 FROM short_term_memory WHERE user_id = ?1 AND expires_at > ?2",
                    params![user_id, now_millis()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            conn.execute(
                "DELETE FROM short_term_memory WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(live)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM short_term_memory WHERE expires_at <= ?1",
                params![now_millis()],
            )?;
            let mut stmt = conn.prepare("SELECT user_id FROM short_term_memory ORDER BY user_id")?;
            let users = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn refresh_ttl(&self, user_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let user_id = user_id.to_string();
        let expires_at = Self::expiry_from_now(ttl.unwrap_or(self.policy.ttl));
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE short_term_memory SET expires_at = ?1 WHERE user_id = ?2 AND expires_at > ?3",
                params![expires_at, user_id, now_millis()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// 短期记忆入口：主后端 + 进程内降级后端
///
/// 主后端返回 BackendUnavailable 时切换到降级后端（仅在本实例生命周期内有效、不持久），
/// 之后的读写都走降级后端，直到实例销毁。
pub struct ShortTermStore {
    primary: Arc<dyn ShortTermBackend>,
    fallback: InMemoryShortTerm,
    fallback_active: AtomicBool,
}

impl ShortTermStore {
    pub fn new(primary: Arc<dyn ShortTermBackend>, policy: ShortTermPolicy) -> Self {
        Self {
            primary,
            fallback: InMemoryShortTerm::new(policy),
            fallback_active: AtomicBool::new(false),
        }
    }

    /// 仅使用进程内存储
    pub fn in_memory(policy: ShortTermPolicy) -> Self {
        Self::new(Arc::new(InMemoryShortTerm::new(policy)), policy)
    }

    /// 按路径打开 SQLite 后端；打开失败时直接以降级模式启动
    pub fn open_or_fallback(path: &Path, policy: ShortTermPolicy) -> Self {
        match SqliteShortTerm::open(path, policy) {
            Ok(backend) => Self::new(Arc::new(backend), policy),
            Err(e) => {
                let store = Self::in_memory(policy);
                store.activate_fallback(&e.to_string());
                store
            }
        }
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::SeqCst)
    }

    fn activate_fallback(&self, reason: &str) {
        if !self.fallback_active.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                backend = self.primary.backend_name(),
                reason,
                "short-term backend unavailable, using non-durable in-process store"
            );
        }
    }

    /// 主后端调用结果：BackendUnavailable 触发降级并返回 None，其余原样返回
    fn degrade<T>(&self, result: Result<T>) -> Option<Result<T>> {
        match result {
            Err(CoreError::BackendUnavailable(reason)) => {
                self.activate_fallback(&reason);
                None
            }
            other => Some(other),
        }
    }

    pub async fn store(&self, user_id: &str, turns: Vec<Turn>) -> Result<()> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.store(user_id, turns.clone()).await) {
                return r;
            }
        }
        self.fallback.store(user_id, turns).await
    }

    pub async fn get(&self, user_id: &str) -> Result<Vec<Turn>> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.get(user_id).await) {
                return r;
            }
        }
        self.fallback.get(user_id).await
    }

    pub async fn append(&self, user_id: &str, turn: Turn) -> Result<()> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.append(user_id, turn.clone()).await) {
                return r;
            }
        }
        self.fallback.append(user_id, turn).await
    }

    pub async fn delete(&self, user_id: &str) -> Result<bool> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.delete(user_id).await) {
                return r;
            }
        }
        self.fallback.delete(user_id).await
    }

    pub async fn list_users(&self) -> Result<Vec<String>> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.list_users().await) {
                return r;
            }
        }
        self.fallback.list_users().await
    }

    pub async fn refresh_ttl(&self, user_id: &str, ttl: Option<Duration>) -> Result<bool> {
        if !self.fallback_active() {
            if let Some(r) = self.degrade(self.primary.refresh_ttl(user_id, ttl).await) {
                return r;
            }
        }
        self.fallback.refresh_ttl(user_id, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: usize, ttl_secs: u64) -> ShortTermPolicy {
        ShortTermPolicy {
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn contents(turns: &[Turn]) -> Vec<String> {
        turns.iter().map(|t| t.content.clone()).collect()
    }

    /// 总是不可用的后端，用于验证降级
    struct DownBackend;

    #[async_trait]
    impl ShortTermBackend for DownBackend {
        async fn store(&self, _: &str, _: Vec<Turn>) -> Result<()> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Vec<Turn>> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        async fn append(&self, _: &str, _: Turn) -> Result<()> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        async fn list_users(&self) -> Result<Vec<String>> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        async fn refresh_ttl(&self, _: &str, _: Option<Duration>) -> Result<bool> {
            Err(CoreError::BackendUnavailable("connection refused".into()))
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_capacity_is_strict_fifo() {
        let backend = InMemoryShortTerm::new(policy(3, 60));
        for i in 0..5 {
            backend.append("u1", Turn::user(format!("m{i}"))).await.unwrap();
        }
        let turns = backend.get("u1").await.unwrap();
        assert_eq!(contents(&turns), vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_store_truncates_to_capacity() {
        let backend = InMemoryShortTerm::new(policy(2, 60));
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        backend.store("u1", turns).await.unwrap();
        assert_eq!(contents(&backend.get("u1").await.unwrap()), vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_key_ttl_expiry() {
        let backend = InMemoryShortTerm::new(policy(10, 60));
        backend.append("u1", Turn::user("first")).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        backend.append("u1", Turn::user("second")).await.unwrap();

        // 第二次写入重置了整键 TTL
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(backend.get("u1").await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(backend.get("u1").await.unwrap().is_empty());
        assert!(backend.list_users().await.unwrap().is_empty());
        assert!(!backend.refresh_ttl("u1", None).await.unwrap());

        // 过期后写入从空列表开始
        backend.append("u1", Turn::user("third")).await.unwrap();
        assert_eq!(contents(&backend.get("u1").await.unwrap()), vec!["third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_ttl_extends_expiry() {
        let backend = InMemoryShortTerm::new(policy(10, 60));
        backend.append("u1", Turn::user("hello")).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(backend.refresh_ttl("u1", Some(Duration::from_secs(120))).await.unwrap());
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(backend.get("u1").await.unwrap().len(), 1);
        assert!(!backend.refresh_ttl("nobody", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteShortTerm::open(dir.path().join("short.db"), policy(2, 60)).unwrap();

        backend.append("alice", Turn::user("one")).await.unwrap();
        backend.append("alice", Turn::assistant("two")).await.unwrap();
        backend.append("alice", Turn::user("three")).await.unwrap();
        backend.append("bob", Turn::user("hey")).await.unwrap();

        assert_eq!(contents(&backend.get("alice").await.unwrap()), vec!["two", "three"]);
        assert_eq!(backend.list_users().await.unwrap(), vec!["alice", "bob"]);
        assert!(backend.refresh_ttl("alice", None).await.unwrap());
        assert!(backend.delete("bob").await.unwrap());
        assert!(!backend.delete("bob").await.unwrap());
        assert!(backend.get("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_expired_rows_read_empty() {
        let backend = SqliteShortTerm::open_in_memory(ShortTermPolicy {
            capacity: 5,
            ttl: Duration::ZERO,
        })
        .unwrap();
        backend.append("u1", Turn::user("gone")).await.unwrap();
        assert!(backend.get("u1").await.unwrap().is_empty());
        assert!(backend.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_is_surfaced() {
        let store = ShortTermStore::new(Arc::new(DownBackend), policy(5, 60));
        assert!(!store.fallback_active());

        store.append("u1", Turn::user("still works")).await.unwrap();
        assert!(store.fallback_active());
        assert_eq!(contents(&store.get("u1").await.unwrap()), vec!["still works"]);
        assert_eq!(store.list_users().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_open_or_fallback_with_bad_path() {
        let store = ShortTermStore::open_or_fallback(
            Path::new("/proc/definitely/not/writable/short.db"),
            policy(5, 60),
        );
        assert!(store.fallback_active());
        store.append("u1", Turn::user("x")).await.unwrap();
        assert_eq!(store.get("u1").await.unwrap().len(), 1);
    }
}
