//! 工作流类型定义
//!
//! 对话工作流的任务种类、依赖关系、任务 / 工作流状态与构建错误

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type WorkflowId = String;

/// 工作流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// 已创建，等待执行
    Created,
    /// 正在执行
    Running,
    /// 响应路径已完成（后台写任务可能仍在运行）
    Completed,
    /// 致命任务失败或超过截止时间
    Failed,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// 等待依赖满足
    Waiting,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 超出预算被取消
    TimedOut,
    /// 因其他任务致命失败而未执行
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Waiting | TaskState::Running)
    }
}

/// 对话工作流中的任务种类；拓扑固定，不在运行时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    LoadMemory,
    RagRetrieve,
    KgSearch,
    Generate,
    PersistMemory,
    ExtractKnowledge,
}

/// 任务所属阶段：响应路径上的任务决定调用结果，后台任务不阻塞响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Response,
    Background,
}

/// 任务失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 中止本次调用
    Fatal,
    /// 保留默认的“无信息”上下文，继续执行
    Degrade,
    /// 仅记录日志（后台任务）
    LogOnly,
}

/// ConversationState 中可被任务写入的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateField {
    MemoryContext,
    ShortMemoryContext,
    Query,
    RagContext,
    KgContext,
    Turns,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::LoadMemory,
        TaskKind::RagRetrieve,
        TaskKind::KgSearch,
        TaskKind::Generate,
        TaskKind::PersistMemory,
        TaskKind::ExtractKnowledge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::LoadMemory => "load_memory",
            TaskKind::RagRetrieve => "rag_retrieve",
            TaskKind::KgSearch => "kg_search",
            TaskKind::Generate => "generate",
            TaskKind::PersistMemory => "persist_memory",
            TaskKind::ExtractKnowledge => "extract_knowledge",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            TaskKind::PersistMemory | TaskKind::ExtractKnowledge => Phase::Background,
            _ => Phase::Response,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            TaskKind::LoadMemory | TaskKind::Generate => FailurePolicy::Fatal,
            TaskKind::RagRetrieve | TaskKind::KgSearch => FailurePolicy::Degrade,
            TaskKind::PersistMemory | TaskKind::ExtractKnowledge => FailurePolicy::LogOnly,
        }
    }

    /// 该任务允许写入的状态字段；并发任务的字段互不相交
    pub fn owned_fields(&self) -> &'static [StateField] {
        match self {
            TaskKind::LoadMemory => &[
                StateField::MemoryContext,
                StateField::ShortMemoryContext,
                StateField::Query,
            ],
            TaskKind::RagRetrieve => &[StateField::RagContext],
            TaskKind::KgSearch => &[StateField::KgContext],
            TaskKind::Generate => &[StateField::Turns],
            TaskKind::PersistMemory | TaskKind::ExtractKnowledge => &[],
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 任务依赖类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDependencies {
    /// 无依赖，可立即执行
    None,
    /// 顺序依赖：指定任务结束后执行
    Sequential(TaskKind),
    /// AND 依赖：所有指定任务都结束（屏障）
    All(Vec<TaskKind>),
}

impl TaskDependencies {
    pub fn predecessors(&self) -> Vec<TaskKind> {
        match self {
            TaskDependencies::None => Vec::new(),
            TaskDependencies::Sequential(dep) => vec![*dep],
            TaskDependencies::All(deps) => deps.clone(),
        }
    }
}

/// 工作流中的任务节点
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub kind: TaskKind,
    pub dependencies: TaskDependencies,
    pub state: TaskState,
}

/// 工作流定义
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub tasks: BTreeMap<TaskKind, WorkflowTask>,
    pub status: WorkflowStatus,
    /// 创建时间（毫秒）
    pub created_at: i64,
}

/// 工作流构建错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskKind),
    #[error("Cyclic dependency detected")]
    CyclicDependency,
    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
}
