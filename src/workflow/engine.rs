//! 工作流引擎
//!
//! 按依赖图调度任务：入度归零的任务立即 spawn，同层任务并发执行，后继任务在屏障处等待全部前驱结束。
//! 每个任务拿到状态快照，返回的补丁由引擎按字段所有权合并。
//!
//! - 读任务（RAG / KG 检索）失败或超出预算时降级为“无信息”上下文
//! - Load-Memory / Generate 失败或整体截止时间到达时本次调用失败，不追加任何 assistant Turn
//! - Generate 完成后立即返回，后台写任务在独立预算内执行，通过 [`BackgroundWrites`] 等待其结束

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowSection;
use crate::core::{CoreError, Result};
use crate::memory::Role;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::state::{ConversationState, StatePatch};
use crate::workflow::types::*;

/// 工作流任务执行器 trait
#[async_trait]
pub trait WorkflowTaskExecutor: Send + Sync {
    /// 执行单个任务；state 为调度时刻的只读快照
    async fn execute(&self, task: TaskKind, state: Arc<ConversationState>) -> Result<StatePatch>;
}

/// 时间预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// 响应路径的总截止时间
    pub deadline: Duration,
    /// 单个读任务的预算（不超过剩余截止时间）
    pub read_timeout: Duration,
    /// 后台写任务的预算，从 Generate 完成时起算
    pub write_timeout: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&WorkflowSection::default())
    }
}

impl From<&WorkflowSection> for EngineLimits {
    fn from(cfg: &WorkflowSection) -> Self {
        Self {
            deadline: Duration::from_secs(cfg.deadline_secs),
            read_timeout: Duration::from_secs(cfg.read_timeout_secs),
            write_timeout: Duration::from_secs(cfg.write_timeout_secs),
        }
    }
}

/// 后台写任务的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub completed: Vec<TaskKind>,
    pub failed: Vec<(TaskKind, String)>,
    pub timed_out: Vec<TaskKind>,
}

impl WriteReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 后台写任务句柄；wait() 在全部写任务结束（或超出预算被放弃）后返回
pub struct BackgroundWrites {
    handle: Option<JoinHandle<WriteReport>>,
}

impl BackgroundWrites {
    pub fn none() -> Self {
        Self { handle: None }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }

    pub async fn wait(self) -> WriteReport {
        match self.handle {
            None => WriteReport::default(),
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "background writes aborted");
                WriteReport::default()
            }),
        }
    }
}

impl fmt::Debug for BackgroundWrites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundWrites")
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// 一次调用的结果
#[derive(Debug)]
pub struct RunOutcome {
    pub workflow_id: WorkflowId,
    pub state: ConversationState,
    pub status: WorkflowStatus,
    /// 致命错误（status == Failed 时存在）
    pub error: Option<CoreError>,
    /// 响应路径上各任务的最终状态；后台任务记为 Running，结果见 WriteReport
    pub tasks: BTreeMap<TaskKind, TaskState>,
    pub background: BackgroundWrites,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

type TaskFuture = BoxFuture<'static, (TaskKind, Result<StatePatch>)>;

pub struct WorkflowEngine {
    workflow: Workflow,
    executor: Arc<dyn WorkflowTaskExecutor>,
    limits: EngineLimits,
}

impl WorkflowEngine {
    /// 使用固定的对话拓扑
    pub fn new(
        executor: Arc<dyn WorkflowTaskExecutor>,
        limits: EngineLimits,
    ) -> std::result::Result<Self, WorkflowError> {
        Ok(Self {
            workflow: Workflow::conversation()?,
            executor,
            limits,
        })
    }

    /// 替换为另一个已校验的工作流（测试用更小的图）
    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn limits(&self) -> EngineLimits {
        self.limits
    }

    pub async fn run(&self, user_id: &str, session_id: &str, message: &str, round: u64) -> RunOutcome {
        let mut state = ConversationState::new(user_id, session_id, message, round);
        let workflow_id = format!("wf_{}", uuid::Uuid::new_v4());
        let mut tasks: BTreeMap<TaskKind, TaskState> = self
            .workflow
            .tasks
            .keys()
            .map(|k| (*k, TaskState::Waiting))
            .collect();

        if user_id.trim().is_empty() || message.trim().is_empty() {
            return failed(
                workflow_id,
                state,
                tasks,
                CoreError::Validation("user_id and message must not be empty".into()),
            );
        }

        let started = Instant::now();
        let deadline = started + self.limits.deadline;
        let cancel = CancellationToken::new();
        let mut graph = WorkflowGraph::new(&self.workflow.tasks);
        let mut in_flight: FuturesUnordered<TaskFuture> = FuturesUnordered::new();
        let mut background_ready: Vec<TaskKind> = Vec::new();

        tracing::info!(workflow_id = %workflow_id, user_id, session_id, round, "workflow started");

        for kind in graph.get_ready_tasks(&tasks) {
            self.schedule(kind, &state, &mut tasks, &mut in_flight, &mut background_ready, deadline, &cancel);
        }

        while !response_finished(&tasks) {
            let (kind, result) = match timeout_at(deadline, in_flight.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    cancel.cancel();
                    for s in tasks.values_mut() {
                        if *s == TaskState::Running {
                            *s = TaskState::TimedOut;
                        }
                    }
                    tracing::error!(workflow_id = %workflow_id, deadline = ?self.limits.deadline, "workflow deadline exceeded");
                    return failed(
                        workflow_id,
                        state,
                        tasks,
                        CoreError::DeadlineExceeded(format!("workflow exceeded {:?}", self.limits.deadline)),
                    );
                }
            };

            let merged = result.and_then(|patch| {
                if kind == TaskKind::Generate {
                    check_generation(&patch)?;
                }
                state.apply(kind, patch)
            });

            match merged {
                Ok(()) => {
                    tasks.insert(kind, TaskState::Completed);
                    tracing::debug!(task = %kind, "task completed");
                }
                Err(e) => {
                    let terminal = if matches!(e, CoreError::DeadlineExceeded(_)) {
                        TaskState::TimedOut
                    } else {
                        TaskState::Failed
                    };
                    tasks.insert(kind, terminal);
                    if kind.failure_policy() == FailurePolicy::Fatal {
                        cancel.cancel();
                        tracing::error!(workflow_id = %workflow_id, task = %kind, error = %e, "fatal task failure");
                        return failed(workflow_id, state, tasks, e);
                    }
                    tracing::warn!(task = %kind, error = %e, "read task failed, continuing without its context");
                }
            }

            for next in graph.mark_completed(kind) {
                self.schedule(next, &state, &mut tasks, &mut in_flight, &mut background_ready, deadline, &cancel);
            }
        }

        if !response_finished(&tasks) {
            return failed(
                workflow_id,
                state,
                tasks,
                CoreError::TaskAborted("response path stalled before completion".into()),
            );
        }

        let background = if background_ready.is_empty() {
            BackgroundWrites::none()
        } else {
            for kind in &background_ready {
                tasks.insert(*kind, TaskState::Running);
            }
            BackgroundWrites {
                handle: Some(tokio::spawn(drive_background(
                    self.executor.clone(),
                    graph,
                    background_ready,
                    Arc::new(state.clone()),
                    self.limits.write_timeout,
                ))),
            }
        };

        tracing::info!(
            workflow_id = %workflow_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "response ready"
        );

        RunOutcome {
            workflow_id,
            state,
            status: WorkflowStatus::Completed,
            error: None,
            tasks,
            background,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule(
        &self,
        kind: TaskKind,
        state: &ConversationState,
        tasks: &mut BTreeMap<TaskKind, TaskState>,
        in_flight: &mut FuturesUnordered<TaskFuture>,
        background_ready: &mut Vec<TaskKind>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        if kind.phase() == Phase::Background {
            background_ready.push(kind);
            return;
        }
        let budget = match kind.failure_policy() {
            FailurePolicy::Degrade => Some(
                self.limits
                    .read_timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
            ),
            _ => None,
        };
        tasks.insert(kind, TaskState::Running);
        tracing::debug!(task = %kind, "task started");
        in_flight.push(spawn_task(
            self.executor.clone(),
            kind,
            Arc::new(state.clone()),
            cancel.child_token(),
            budget,
        ));
    }
}

fn response_finished(tasks: &BTreeMap<TaskKind, TaskState>) -> bool {
    tasks
        .iter()
        .filter(|(kind, _)| kind.phase() == Phase::Response)
        .all(|(_, state)| state.is_terminal())
}

/// Generate 必须恰好追加一条非空的 assistant Turn
fn check_generation(patch: &StatePatch) -> Result<()> {
    match patch.new_turns.as_slice() {
        [turn] if turn.role == Role::Assistant && !turn.content.trim().is_empty() => Ok(()),
        turns => Err(CoreError::Generation(format!(
            "generate must append exactly one non-empty assistant turn, got {}",
            turns.len()
        ))),
    }
}

fn failed(
    workflow_id: WorkflowId,
    state: ConversationState,
    mut tasks: BTreeMap<TaskKind, TaskState>,
    error: CoreError,
) -> RunOutcome {
    for s in tasks.values_mut() {
        if !s.is_terminal() {
            *s = TaskState::Skipped;
        }
    }
    RunOutcome {
        workflow_id,
        state,
        status: WorkflowStatus::Failed,
        error: Some(error),
        tasks,
        background: BackgroundWrites::none(),
    }
}

fn spawn_task(
    executor: Arc<dyn WorkflowTaskExecutor>,
    kind: TaskKind,
    snapshot: Arc<ConversationState>,
    token: CancellationToken,
    budget: Option<Duration>,
) -> TaskFuture {
    let handle = tokio::spawn(async move {
        let work = async move {
            match budget {
                Some(limit) => timeout(limit, executor.execute(kind, snapshot))
                    .await
                    .unwrap_or_else(|_| Err(CoreError::DeadlineExceeded(format!("{kind} exceeded {limit:?}")))),
                None => executor.execute(kind, snapshot).await,
            }
        };
        tokio::select! {
            _ = token.cancelled() => Err(CoreError::TaskAborted(format!("{kind} cancelled"))),
            result = work => result,
        }
    });
    async move {
        let result = handle
            .await
            .unwrap_or_else(|e| Err(CoreError::TaskAborted(format!("{kind}: {e}"))));
        (kind, result)
    }
    .boxed()
}

async fn drive_background(
    executor: Arc<dyn WorkflowTaskExecutor>,
    mut graph: WorkflowGraph,
    ready: Vec<TaskKind>,
    snapshot: Arc<ConversationState>,
    budget: Duration,
) -> WriteReport {
    let deadline = Instant::now() + budget;
    let cancel = CancellationToken::new();
    let mut report = WriteReport::default();
    let mut running: BTreeSet<TaskKind> = BTreeSet::new();
    let mut in_flight: FuturesUnordered<TaskFuture> = FuturesUnordered::new();

    for kind in ready {
        running.insert(kind);
        in_flight.push(spawn_task(executor.clone(), kind, snapshot.clone(), cancel.child_token(), None));
    }

    loop {
        match timeout_at(deadline, in_flight.next()).await {
            Ok(None) => break,
            Ok(Some((kind, result))) => {
                running.remove(&kind);
                match result {
                    Ok(patch) if patch.is_empty() => {
                        tracing::debug!(task = %kind, "background write completed");
                        report.completed.push(kind);
                    }
                    Ok(_) => {
                        tracing::warn!(task = %kind, "background task tried to modify conversation state");
                        report
                            .failed
                            .push((kind, "background task returned state changes".to_string()));
                    }
                    Err(e) => {
                        tracing::warn!(task = %kind, error = %e, "background write failed");
                        report.failed.push((kind, e.to_string()));
                    }
                }
                for next in graph.mark_completed(kind) {
                    running.insert(next);
                    in_flight.push(spawn_task(executor.clone(), next, snapshot.clone(), cancel.child_token(), None));
                }
            }
            Err(_) => {
                cancel.cancel();
                for kind in std::mem::take(&mut running) {
                    tracing::warn!(task = %kind, budget = ?budget, "background write abandoned after timeout");
                    report.timed_out.push(kind);
                }
                break;
            }
        }
    }
    report
}
