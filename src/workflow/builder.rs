//! 工作流构建器
//!
//! 提供流畅的 API 来构建工作流；build 时校验依赖存在、无环，且响应路径任务不依赖后台任务

use std::collections::BTreeMap;

use crate::workflow::graph::WorkflowGraph;
use crate::workflow::types::*;

pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    tasks: BTreeMap<TaskKind, WorkflowTask>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("wf_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// 添加无依赖的任务
    pub fn task(mut self, kind: TaskKind) -> Self {
        self.tasks.insert(
            kind,
            WorkflowTask {
                kind,
                dependencies: TaskDependencies::None,
                state: TaskState::Waiting,
            },
        );
        self
    }

    /// 设置顺序依赖
    pub fn sequential(mut self, from: TaskKind, to: TaskKind) -> Self {
        if let Some(task) = self.tasks.get_mut(&to) {
            task.dependencies = TaskDependencies::Sequential(from);
        }
        self
    }

    /// 设置 AND 依赖（所有前置任务）
    pub fn depends_on_all(mut self, kind: TaskKind, deps: Vec<TaskKind>) -> Self {
        if let Some(task) = self.tasks.get_mut(&kind) {
            task.dependencies = TaskDependencies::All(deps);
        }
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.tasks.is_empty() {
            return Err(WorkflowError::InvalidConfiguration("workflow has no tasks".to_string()));
        }
        for task in self.tasks.values() {
            for dep in task.dependencies.predecessors() {
                if !self.tasks.contains_key(&dep) {
                    return Err(WorkflowError::TaskNotFound(dep));
                }
                if task.kind.phase() == Phase::Response && dep.phase() == Phase::Background {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "{} is on the response path but depends on background task {}",
                        task.kind, dep
                    )));
                }
            }
        }
        WorkflowGraph::new(&self.tasks).topological_order()?;

        Ok(Workflow {
            id: self.id,
            name: self.name,
            tasks: self.tasks,
            status: WorkflowStatus::Created,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

impl Workflow {
    /// 固定的对话拓扑：
    /// LoadMemory -> {RagRetrieve, KgSearch} -> Generate -> {PersistMemory, ExtractKnowledge}
    pub fn conversation() -> Result<Workflow, WorkflowError> {
        WorkflowBuilder::new("conversation")
            .task(TaskKind::LoadMemory)
            .task(TaskKind::RagRetrieve)
            .task(TaskKind::KgSearch)
            .task(TaskKind::Generate)
            .task(TaskKind::PersistMemory)
            .task(TaskKind::ExtractKnowledge)
            .sequential(TaskKind::LoadMemory, TaskKind::RagRetrieve)
            .sequential(TaskKind::LoadMemory, TaskKind::KgSearch)
            .depends_on_all(TaskKind::Generate, vec![TaskKind::RagRetrieve, TaskKind::KgSearch])
            .sequential(TaskKind::Generate, TaskKind::PersistMemory)
            .sequential(TaskKind::Generate, TaskKind::ExtractKnowledge)
            .build()
    }
}
