//! Headless Agent 运行时
//!
//! 对外只有一个请求操作 handle_message：跑一次对话工作流，返回回复文本、成功标志与诊断上下文。
//! 鉴权由注入的 SessionStore 完成（handle_authenticated），HTTP 等外层协议不在这里。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{AppConfig, SessionSection};
use crate::core::{CoreError, Result};
use crate::graph::GraphStore;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{MemoryCoordinator, ShortTermPolicy, ShortTermStore, SqliteLongTerm};
use crate::session::{create_session_store, SessionStore};
use crate::workflow::{
    BackgroundWrites, ConversationSteps, EngineLimits, Retriever, RunOutcome, StepOptions, TaskKind,
    TaskState, WorkflowEngine, WorkflowStatus,
};

/// 致命失败时返回给用户的固定文本，内部错误只写日志
pub const GENERIC_ERROR_MESSAGE: &str = "Sorry, something went wrong while processing your message.";

/// 一次调用的诊断信息（不含在用户回复里）
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticContext {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub round: u64,
    pub tasks: BTreeMap<TaskKind, TaskState>,
    pub memory_context: String,
    pub rag_context: String,
    pub kg_context: String,
    pub error: Option<String>,
}

impl DiagnosticContext {
    fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            workflow_id: outcome.workflow_id.clone(),
            status: outcome.status,
            round: outcome.state.round,
            tasks: outcome.tasks.clone(),
            memory_context: outcome.state.memory_context.clone(),
            rag_context: outcome.state.rag_context.clone(),
            kg_context: outcome.state.kg_context.clone(),
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub assistant_text: String,
    pub success: bool,
    pub diagnostic_context: DiagnosticContext,
    /// 后台写任务（持久化记忆、知识抽取）的句柄
    pub background: BackgroundWrites,
}

/// 单个会话的轮次计数
#[derive(Debug)]
struct RoundCounter {
    /// 已成功完成的最大轮次
    committed: u64,
    /// 已分配、尚未结束的轮次
    in_flight: BTreeSet<u64>,
    last_active: Instant,
}

impl RoundCounter {
    fn new() -> Self {
        Self {
            committed: 0,
            in_flight: BTreeSet::new(),
            last_active: Instant::now(),
        }
    }

    /// 下一轮次 = max(已完成, 进行中) + 1
    fn reserve(&mut self) -> u64 {
        let latest = self.in_flight.last().copied().unwrap_or(0);
        let round = self.committed.max(latest) + 1;
        self.in_flight.insert(round);
        self.last_active = Instant::now();
        round
    }

    /// 失败的轮次只释放，不计入 committed
    fn finish(&mut self, round: u64, success: bool) {
        self.in_flight.remove(&round);
        if success {
            self.committed = self.committed.max(round);
        }
        self.last_active = Instant::now();
    }

    fn is_idle(&self, idle_ttl: Duration) -> bool {
        self.in_flight.is_empty() && self.last_active.elapsed() >= idle_ttl
    }
}

pub struct Agent {
    engine: WorkflowEngine,
    memory: Arc<MemoryCoordinator>,
    graph: Arc<GraphStore>,
    sessions: Arc<dyn SessionStore>,
    rounds: Mutex<HashMap<String, RoundCounter>>,
    /// 计数器闲置超过该时长后可被清理（与会话 TTL 一致）
    round_idle_ttl: Duration,
}

impl Agent {
    pub fn new(
        engine: WorkflowEngine,
        memory: Arc<MemoryCoordinator>,
        graph: Arc<GraphStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            engine,
            memory,
            graph,
            sessions,
            rounds: Mutex::new(HashMap::new()),
            round_idle_ttl: Duration::from_secs(SessionSection::default().ttl_secs),
        }
    }

    pub fn with_round_idle_ttl(mut self, ttl: Duration) -> Self {
        self.round_idle_ttl = ttl;
        self
    }

    /// 按配置组装：短期记忆（SQLite 不可用时降级）、长期记忆、知识图谱、LLM、会话存储
    pub fn from_config(cfg: &AppConfig, retriever: Arc<dyn Retriever>) -> Result<Self> {
        let policy = ShortTermPolicy {
            capacity: cfg.memory.short_term_capacity,
            ttl: cfg.memory.ttl(),
        };
        let short_term = match &cfg.memory.short_term_db {
            Some(path) => ShortTermStore::open_or_fallback(path, policy),
            None => ShortTermStore::in_memory(policy),
        };
        let long_term = Arc::new(SqliteLongTerm::open(&cfg.memory.long_term_db)?);
        let memory = Arc::new(
            MemoryCoordinator::new(short_term, long_term)
                .with_threshold(cfg.memory.importance_threshold)?,
        );
        let graph = Arc::new(GraphStore::open(&cfg.graph.db_path)?);
        let llm = create_llm_from_config(cfg);
        Self::assemble(cfg, memory, graph, llm, retriever, create_session_store(&cfg.session))
    }

    /// 用已构建好的组件组装（测试注入 Mock LLM 与内存存储）
    pub fn assemble(
        cfg: &AppConfig,
        memory: Arc<MemoryCoordinator>,
        graph: Arc<GraphStore>,
        llm: Arc<dyn LlmClient>,
        retriever: Arc<dyn Retriever>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let steps = ConversationSteps::new(
            memory.clone(),
            retriever,
            llm,
            graph.clone(),
            Duration::from_secs(cfg.workflow.tool_timeout_secs),
            StepOptions::from(&cfg.workflow),
        );
        let engine = WorkflowEngine::new(Arc::new(steps), EngineLimits::from(&cfg.workflow))
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(Self::new(engine, memory, graph, sessions)
            .with_round_idle_ttl(Duration::from_secs(cfg.session.ttl_secs)))
    }

    pub fn memory(&self) -> &Arc<MemoryCoordinator> {
        &self.memory
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub async fn handle_message(&self, user_id: &str, session_id: &str, text: &str) -> Reply {
        let round = self
            .rounds
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(RoundCounter::new)
            .reserve();

        let outcome = self.engine.run(user_id, session_id, text, round).await;
        let diagnostic_context = DiagnosticContext::from_outcome(&outcome);
        if let Some(counter) = self.rounds.lock().await.get_mut(session_id) {
            counter.finish(round, outcome.is_success());
        }

        if !outcome.is_success() {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| CoreError::Generation("workflow did not complete".into()));
            tracing::error!(
                user_id,
                session_id,
                workflow_id = %outcome.workflow_id,
                error = %error,
                "conversation workflow failed"
            );
            // 输入校验错误可以原样告知用户
            let assistant_text = if error.is_user_facing() {
                error.to_string()
            } else {
                GENERIC_ERROR_MESSAGE.to_string()
            };
            return Reply {
                assistant_text,
                success: false,
                diagnostic_context,
                background: outcome.background,
            };
        }

        let assistant_text = outcome
            .state
            .assistant_reply()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        tracing::info!(user_id, session_id, round, "exchange completed");

        Reply {
            assistant_text,
            success: true,
            diagnostic_context,
            background: outcome.background,
        }
    }

    /// 先解析会话令牌并刷新过期时间，再处理消息
    pub async fn handle_authenticated(&self, token: &str, text: &str) -> Result<Reply> {
        let session = self
            .sessions
            .resolve(token)
            .await?
            .ok_or_else(|| CoreError::NotFound("session token is unknown or expired".into()))?;
        self.sessions.touch(token).await?;
        Ok(self
            .handle_message(&session.user_id, &session.session_id, text)
            .await)
    }

    /// 注销会话并丢弃其轮次计数；返回令牌是否存在
    pub async fn end_session(&self, token: &str) -> Result<bool> {
        if let Some(session) = self.sessions.resolve(token).await? {
            self.rounds.lock().await.remove(&session.session_id);
        }
        self.sessions.revoke(token).await
    }

    /// 清理过期会话，并丢弃闲置超过会话 TTL 的轮次计数；返回删除的会话数
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let removed = self.sessions.cleanup_expired().await?;
        let mut rounds = self.rounds.lock().await;
        let before = rounds.len();
        rounds.retain(|_, counter| !counter.is_idle(self.round_idle_ttl));
        let pruned = before - rounds.len();
        if pruned > 0 {
            tracing::debug!(pruned, "idle round counters dropped");
        }
        Ok(removed)
    }

    /// 当前跟踪轮次的会话数
    pub async fn tracked_sessions(&self) -> usize {
        self.rounds.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockReply};
    use crate::session::InMemorySessionStore;
    use crate::workflow::StaticRetriever;

    fn agent(llm: Arc<MockLlmClient>) -> Agent {
        agent_with(llm, &AppConfig::default())
    }

    fn agent_with(llm: Arc<MockLlmClient>, cfg: &AppConfig) -> Agent {
        let memory = Arc::new(MemoryCoordinator::new(
            ShortTermStore::in_memory(ShortTermPolicy::default()),
            Arc::new(SqliteLongTerm::open_in_memory().unwrap()),
        ));
        Agent::assemble(
            cfg,
            memory,
            Arc::new(GraphStore::open_in_memory().unwrap()),
            llm,
            Arc::new(StaticRetriever::default()),
            Arc::new(InMemorySessionStore::new(Duration::from_secs(cfg.session.ttl_secs))),
        )
        .unwrap()
    }

    #[test]
    fn test_round_counter_reservations() {
        let mut counter = RoundCounter::new();
        assert_eq!(counter.reserve(), 1);
        assert_eq!(counter.reserve(), 2);
        counter.finish(2, true);
        counter.finish(1, false);
        assert_eq!(counter.reserve(), 3);
        counter.finish(3, false);
        assert_eq!(counter.reserve(), 3);
        assert!(!counter.is_idle(Duration::ZERO));
        counter.finish(3, true);
        assert!(counter.is_idle(Duration::ZERO));
        assert!(!counter.is_idle(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_concurrent_messages_get_distinct_rounds() {
        let llm = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(50)));
        let agent = agent(llm);

        let (a, b) = tokio::join!(
            agent.handle_message("alice", "s1", "one"),
            agent.handle_message("alice", "s1", "two"),
        );
        assert!(a.success && b.success);
        let mut rounds = vec![a.diagnostic_context.round, b.diagnostic_context.round];
        rounds.sort();
        assert_eq!(rounds, vec![1, 2]);
        a.background.wait().await;
        b.background.wait().await;

        let third = agent.handle_message("alice", "s1", "three").await;
        assert_eq!(third.diagnostic_context.round, 3);
        third.background.wait().await;

        // 其他会话独立计数
        let other = agent.handle_message("alice", "s2", "hi").await;
        assert_eq!(other.diagnostic_context.round, 1);
        other.background.wait().await;
    }

    #[tokio::test]
    async fn test_round_counters_are_dropped_with_sessions() {
        let agent = agent(Arc::new(MockLlmClient::new()));
        let session = agent.sessions().create("bob").await.unwrap();
        let reply = agent.handle_authenticated(&session.token, "hello").await.unwrap();
        reply.background.wait().await;
        assert_eq!(agent.tracked_sessions().await, 1);

        assert!(agent.end_session(&session.token).await.unwrap());
        assert_eq!(agent.tracked_sessions().await, 0);
        assert!(agent.sessions().resolve(&session.token).await.unwrap().is_none());
        assert!(!agent.end_session(&session.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_round_counters() {
        let mut cfg = AppConfig::default();
        cfg.session.ttl_secs = 0;
        let agent = agent_with(Arc::new(MockLlmClient::new()), &cfg);
        agent.sessions().create("carol").await.unwrap();

        let reply = agent.handle_message("carol", "s1", "hello").await;
        assert_eq!(reply.diagnostic_context.round, 1);
        reply.background.wait().await;

        assert_eq!(agent.cleanup_expired_sessions().await.unwrap(), 1);
        assert_eq!(agent.tracked_sessions().await, 0);
        let reply = agent.handle_message("carol", "s1", "again").await;
        assert_eq!(reply.diagnostic_context.round, 1);
        reply.background.wait().await;
    }

    #[tokio::test]
    async fn test_rounds_advance_on_success_only() {
        let llm = Arc::new(MockLlmClient::with_replies(vec![
            MockReply::Text("kg".into()),
            MockReply::Text("first".into()),
            MockReply::Text("nothing to store".into()),
            MockReply::Text("kg".into()),
            MockReply::Fail("provider down".into()),
        ]));
        let agent = agent(llm);

        let reply = agent.handle_message("alice", "s1", "hello").await;
        assert!(reply.success);
        assert_eq!(reply.assistant_text, "first");
        assert_eq!(reply.diagnostic_context.round, 1);
        reply.background.wait().await;

        let reply = agent.handle_message("alice", "s1", "again").await;
        assert!(!reply.success);
        assert_eq!(reply.assistant_text, GENERIC_ERROR_MESSAGE);
        assert_eq!(reply.diagnostic_context.round, 2);
        assert!(reply.diagnostic_context.error.is_some());

        // 失败的轮次不计数
        let reply = agent.handle_message("alice", "s1", "third").await;
        assert_eq!(reply.diagnostic_context.round, 2);
    }

    #[tokio::test]
    async fn test_empty_message_is_reported() {
        let agent = agent(Arc::new(MockLlmClient::new()));
        let reply = agent.handle_message("alice", "s1", "   ").await;
        assert!(!reply.success);
        assert!(reply.assistant_text.starts_with("Validation error"));
    }

    #[tokio::test]
    async fn test_authenticated_requests() {
        let agent = agent(Arc::new(MockLlmClient::new()));
        let session = agent.sessions().create("bob").await.unwrap();

        let reply = agent.handle_authenticated(&session.token, "hi there").await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.assistant_text, "Echo from Mock: hi there");
        reply.background.wait().await;

        assert!(matches!(
            agent.handle_authenticated("bogus", "hi").await,
            Err(CoreError::NotFound(_))
        ));
    }
}
