//! 工作流依赖图
//!
//! 使用邻接表和入度表实现 DAG 调度：任务结束时递减后继的入度，入度归零即可执行

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::workflow::types::*;

/// 工作流依赖图
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    /// 邻接表：任务 -> 依赖该任务的任务列表
    pub adjacency: HashMap<TaskKind, Vec<TaskKind>>,
    /// 入度表：任务 -> 未结束的依赖数
    pub in_degree: HashMap<TaskKind, usize>,
}

impl WorkflowGraph {
    pub fn new(tasks: &BTreeMap<TaskKind, WorkflowTask>) -> Self {
        let mut adjacency: HashMap<TaskKind, Vec<TaskKind>> = HashMap::new();
        let mut in_degree: HashMap<TaskKind, usize> = HashMap::new();

        for kind in tasks.keys() {
            in_degree.insert(*kind, 0);
            adjacency.insert(*kind, Vec::new());
        }

        for (kind, task) in tasks {
            for dep in task.dependencies.predecessors() {
                adjacency.entry(dep).or_default().push(*kind);
                *in_degree.entry(*kind).or_insert(0) += 1;
            }
        }

        Self { adjacency, in_degree }
    }

    /// 可执行的任务（入度为 0 且仍在等待），按任务顺序排列
    pub fn get_ready_tasks(&self, states: &BTreeMap<TaskKind, TaskState>) -> Vec<TaskKind> {
        let mut ready: Vec<TaskKind> = self
            .in_degree
            .iter()
            .filter(|(kind, degree)| {
                **degree == 0 && matches!(states.get(*kind), Some(TaskState::Waiting) | None)
            })
            .map(|(kind, _)| *kind)
            .collect();
        ready.sort();
        ready
    }

    /// 标记任务结束（成功或可降级的失败），返回新变为可执行的任务
    pub fn mark_completed(&mut self, finished: TaskKind) -> Vec<TaskKind> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.adjacency.get(&finished) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(*dependent);
                    }
                }
            }
        }
        newly_ready.sort();
        newly_ready
    }

    /// Kahn 拓扑排序；存在环时返回 CyclicDependency
    pub fn topological_order(&self) -> Result<Vec<TaskKind>, WorkflowError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<TaskKind> = {
            let mut roots: Vec<TaskKind> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(k, _)| *k)
                .collect();
            roots.sort();
            roots.into()
        };
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(kind) = queue.pop_front() {
            order.push(kind);
            if let Some(dependents) = self.adjacency.get(&kind) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            Err(WorkflowError::CyclicDependency)
        }
    }
}
