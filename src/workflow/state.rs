//! 单次调用的对话状态与任务输出合并
//!
//! 每个任务拿到状态快照（只读），返回 StatePatch；引擎按字段所有权合并：
//! 标量上下文整体替换，Turn 列表只追加。

use serde::Serialize;

use super::types::{StateField, TaskKind};
use crate::core::{CoreError, Result};
use crate::memory::{Role, Turn};

/// 检索失败或没有结果时的上下文值
pub const NO_INFO: &str = "No relevant information found.";

#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    pub user_id: String,
    pub session_id: String,
    /// 会话内的轮次（从 1 开始）
    pub round: u64,
    pub turns: Vec<Turn>,
    /// 本轮检索用的查询文本
    pub query: String,
    /// 合并历史（短期 ∪ 长期）
    pub memory_context: String,
    /// 短期窗口内的近期对话
    pub short_memory_context: String,
    pub rag_context: String,
    pub kg_context: String,
}

impl ConversationState {
    pub fn new(user_id: &str, session_id: &str, message: &str, round: u64) -> Self {
        let turn = Turn::user(message)
            .with_metadata("session_id", session_id)
            .with_metadata("round", round);
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            round,
            turns: vec![turn],
            query: message.to_string(),
            memory_context: String::new(),
            short_memory_context: String::new(),
            rag_context: NO_INFO.to_string(),
            kg_context: NO_INFO.to_string(),
        }
    }

    /// 最后一条 User 消息
    pub fn last_user_message(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::User)
    }

    /// 最后一条 Assistant 消息
    pub fn assistant_reply(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }

    /// 合并任务输出；写入非本任务字段时拒绝整个补丁
    pub fn apply(&mut self, kind: TaskKind, patch: StatePatch) -> Result<()> {
        let owned = kind.owned_fields();
        if let Some(field) = patch.touched_fields().into_iter().find(|f| !owned.contains(f)) {
            return Err(CoreError::Validation(format!(
                "task {kind} wrote {field:?}, which it does not own"
            )));
        }
        if let Some(v) = patch.memory_context {
            self.memory_context = v;
        }
        if let Some(v) = patch.short_memory_context {
            self.short_memory_context = v;
        }
        if let Some(v) = patch.query {
            self.query = v;
        }
        if let Some(v) = patch.rag_context {
            self.rag_context = v;
        }
        if let Some(v) = patch.kg_context {
            self.kg_context = v;
        }
        self.turns.extend(patch.new_turns);
        Ok(())
    }
}

/// 任务输出：None 表示不修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub memory_context: Option<String>,
    pub short_memory_context: Option<String>,
    pub query: Option<String>,
    pub rag_context: Option<String>,
    pub kg_context: Option<String>,
    pub new_turns: Vec<Turn>,
}

impl StatePatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rag_context(context: impl Into<String>) -> Self {
        Self {
            rag_context: Some(context.into()),
            ..Self::default()
        }
    }

    pub fn kg_context(context: impl Into<String>) -> Self {
        Self {
            kg_context: Some(context.into()),
            ..Self::default()
        }
    }

    pub fn append_turn(turn: Turn) -> Self {
        Self {
            new_turns: vec![turn],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }

    pub fn touched_fields(&self) -> Vec<StateField> {
        let mut fields = Vec::new();
        if self.memory_context.is_some() {
            fields.push(StateField::MemoryContext);
        }
        if self.short_memory_context.is_some() {
            fields.push(StateField::ShortMemoryContext);
        }
        if self.query.is_some() {
            fields.push(StateField::Query);
        }
        if self.rag_context.is_some() {
            fields.push(StateField::RagContext);
        }
        if self.kg_context.is_some() {
            fields.push(StateField::KgContext);
        }
        if !self.new_turns.is_empty() {
            fields.push(StateField::Turns);
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = ConversationState::new("alice", "s1", "I like cats", 1);
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].role, Role::User);
        assert_eq!(state.turns[0].metadata["session_id"], "s1");
        assert_eq!(state.rag_context, NO_INFO);
        assert_eq!(state.kg_context, NO_INFO);
        assert!(state.assistant_reply().is_none());
    }

    #[test]
    fn test_merge_replaces_scalars_and_appends_turns() {
        let mut state = ConversationState::new("alice", "s1", "hi", 1);
        state
            .apply(TaskKind::RagRetrieve, StatePatch::rag_context("Reference 1: cats"))
            .unwrap();
        state
            .apply(TaskKind::Generate, StatePatch::append_turn(Turn::assistant("hello")))
            .unwrap();
        assert_eq!(state.rag_context, "Reference 1: cats");
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.assistant_reply().unwrap().content, "hello");
    }

    #[test]
    fn test_merge_rejects_foreign_fields() {
        let mut state = ConversationState::new("alice", "s1", "hi", 1);
        let err = state
            .apply(TaskKind::KgSearch, StatePatch::rag_context("stolen"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(state.rag_context, NO_INFO);
        assert!(state
            .apply(TaskKind::PersistMemory, StatePatch::append_turn(Turn::user("x")))
            .is_err());
        assert!(state.apply(TaskKind::PersistMemory, StatePatch::empty()).is_ok());
    }
}
