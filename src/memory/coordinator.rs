//! 记忆协调器：合并短期与长期两层，按重要性决定是否写入长期记忆
//!
//! - add_turn 总是写短期；importance_score >= 阈值时再写长期
//! - get_combined 以短期 id 集合去重后拼接长期条目，按时间稳定排序后保留最近 limit 条
//! - search 两层子串匹配，去重后最新在前
//! - import_history 把外部 JSON 历史记录规范化为 Turn 后逐条走 add_turn

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::long_term::{LongTermStore, OrderBy};
use super::short_term::ShortTermStore;
use super::turn::{clamp_score, Turn};
use crate::core::{CoreError, Result};

/// 单个用户的记忆统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub short_term_count: usize,
    pub long_term_count: usize,
    /// 短期记忆是否已降级到进程内存储
    pub short_term_fallback: bool,
}

/// 历史导入结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryImport {
    pub imported: usize,
    /// 其中同时写入长期记忆的条数
    pub promoted: usize,
    /// 被跳过的记录（下标 + 原因）
    pub skipped: Vec<(usize, String)>,
}

pub struct MemoryCoordinator {
    short_term: ShortTermStore,
    long_term: Arc<dyn LongTermStore>,
    /// f32 位模式，避免为单个阈值加锁
    threshold: AtomicU32,
}

impl MemoryCoordinator {
    pub const DEFAULT_THRESHOLD: f32 = 0.5;

    pub fn new(short_term: ShortTermStore, long_term: Arc<dyn LongTermStore>) -> Self {
        Self {
            short_term,
            long_term,
            threshold: AtomicU32::new(Self::DEFAULT_THRESHOLD.to_bits()),
        }
    }

    pub fn with_threshold(self, threshold: f32) -> Result<Self> {
        self.set_importance_threshold(threshold)?;
        Ok(self)
    }

    pub fn importance_threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::SeqCst))
    }

    pub fn set_importance_threshold(&self, value: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(CoreError::Validation(format!(
                "importance threshold {value} outside [0, 1]"
            )));
        }
        self.threshold.store(value.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn short_term(&self) -> &ShortTermStore {
        &self.short_term
    }

    /// 写入一条 Turn；返回是否同时写入了长期记忆
    pub async fn add_turn(&self, user_id: &str, mut turn: Turn, importance_score: f32) -> Result<bool> {
        if user_id.trim().is_empty() {
            return Err(CoreError::Validation("user_id must not be empty".into()));
        }
        turn.importance_score = clamp_score(importance_score);

        self.short_term.append(user_id, turn.clone()).await?;

        if turn.importance_score >= self.importance_threshold() {
            self.long_term.add(user_id, &turn, turn.importance_score).await?;
            tracing::debug!(user_id, entry_id = %turn.id, "turn promoted to long-term memory");
            return Ok(true);
        }
        Ok(false)
    }

    /// 导入外部历史记录（按时间升序），每条记录的 importance_score 决定是否进入长期记忆
    ///
    /// 无法解析的记录记日志后跳过；存储失败直接返回错误。
    pub async fn import_history(&self, user_id: &str, records: &[Value]) -> Result<HistoryImport> {
        if user_id.trim().is_empty() {
            return Err(CoreError::Validation("user_id must not be empty".into()));
        }
        let mut turns = Vec::with_capacity(records.len());
        let mut report = HistoryImport::default();
        for (index, record) in records.iter().enumerate() {
            match Turn::from_value(record) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    tracing::warn!(user_id, index, error = %e, "skipping history record");
                    report.skipped.push((index, e.to_string()));
                }
            }
        }
        turns.sort_by_key(|t| t.timestamp);
        for turn in turns {
            let score = turn.importance_score;
            if self.add_turn(user_id, turn, score).await? {
                report.promoted += 1;
            }
            report.imported += 1;
        }
        tracing::info!(
            user_id,
            imported = report.imported,
            promoted = report.promoted,
            skipped = report.skipped.len(),
            "history imported"
        );
        Ok(report)
    }

    /// 合并视图：短期 ∪ 长期（可选），按 id 去重，时间升序，保留最近 limit 条
    pub async fn get_combined(&self, user_id: &str, include_long_term: bool, limit: usize) -> Result<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut turns = self.short_term.get(user_id).await?;
        if include_long_term {
            let mut seen: HashSet<Uuid> = turns.iter().map(|t| t.id).collect();
            let long = self.long_term.get(user_id, limit, OrderBy::Recency).await?;
            turns.extend(long.into_iter().filter(|t| seen.insert(t.id)));
        }
        turns.sort_by_key(|t| t.timestamp);
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.split_off(skip))
    }

    /// 两层子串搜索（不区分大小写），去重，最新在前
    pub async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Turn>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::Validation("search query must not be empty".into()));
        }
        let needle = query.to_lowercase();
        let mut hits: Vec<Turn> = self
            .short_term
            .get(user_id)
            .await?
            .into_iter()
            .filter(|t| t.content.to_lowercase().contains(&needle))
            .collect();

        let mut seen: HashSet<Uuid> = hits.iter().map(|t| t.id).collect();
        let long = self.long_term.search(user_id, query, limit).await?;
        hits.extend(long.into_iter().filter(|t| seen.insert(t.id)));

        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits.truncate(limit);
        Ok(hits)
    }

    /// 最近 limit 条短期记忆（时间升序）
    pub async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let mut turns = self.short_term.get(user_id).await?;
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.split_off(skip))
    }

    pub async fn stats(&self, user_id: &str) -> Result<MemoryStats> {
        Ok(MemoryStats {
            short_term_count: self.short_term.get(user_id).await?.len(),
            long_term_count: self.long_term.count(user_id).await?,
            short_term_fallback: self.short_term.fallback_active(),
        })
    }

    pub async fn clear_short_term(&self, user_id: &str) -> Result<bool> {
        self.short_term.delete(user_id).await
    }

    pub async fn clear_long_term(&self, user_id: &str, entry_id: Option<Uuid>) -> Result<usize> {
        self.long_term.delete(user_id, entry_id).await
    }

    pub async fn update_importance(&self, entry_id: Uuid, score: f32) -> Result<()> {
        self.long_term.update_importance(entry_id, score).await
    }

    pub async fn refresh_ttl(&self, user_id: &str) -> Result<bool> {
        self.short_term.refresh_ttl(user_id, None).await
    }

    /// 两层用户并集（排序）
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let mut users = self.short_term.list_users().await?;
        users.extend(self.long_term.list_users().await?);
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// 每条 Turn 一行 `role: content`
    pub fn format_context(turns: &[Turn]) -> String {
        turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
