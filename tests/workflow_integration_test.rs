//! 工作流集成测试：完整 Agent（Mock LLM + SQLite 存储）跑对话 DAG

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use comb::agent::GENERIC_ERROR_MESSAGE;
use comb::config::AppConfig;
use comb::core::{CoreError, Result};
use comb::graph::{GraphStore, RelationshipFilter};
use comb::llm::{MockLlmClient, MockReply, ToolCall};
use comb::memory::{MemoryCoordinator, Role, ShortTermPolicy, ShortTermStore, SqliteLongTerm};
use comb::session::InMemorySessionStore;
use comb::workflow::{Document, Retriever, StaticRetriever, TaskKind, TaskState, NO_INFO};
use comb::Agent;
use serde_json::json;

struct Harness {
    agent: Agent,
    llm: Arc<MockLlmClient>,
}

fn harness(replies: Vec<MockReply>, retriever: Arc<dyn Retriever>) -> Harness {
    let memory = Arc::new(MemoryCoordinator::new(
        ShortTermStore::in_memory(ShortTermPolicy::default()),
        Arc::new(SqliteLongTerm::open_in_memory().unwrap()),
    ));
    let llm = Arc::new(MockLlmClient::with_replies(replies));
    let agent = Agent::assemble(
        &AppConfig::default(),
        memory,
        Arc::new(GraphStore::open_in_memory().unwrap()),
        llm.clone(),
        retriever,
        Arc::new(InMemorySessionStore::new(Duration::from_secs(60))),
    )
    .unwrap();
    Harness { agent, llm }
}

fn call(name: &str, arguments: serde_json::Value) -> MockReply {
    MockReply::ToolCalls(vec![ToolCall {
        id: "call_0".into(),
        name: name.into(),
        arguments,
    }])
}

struct BrokenRetriever;

#[async_trait]
impl Retriever for BrokenRetriever {
    async fn retrieve(&self, _query: &str) -> Result<Vec<Document>> {
        Err(CoreError::BackendUnavailable("vector index offline".into()))
    }
}

#[tokio::test]
async fn test_remembers_preferences_across_rounds() {
    let h = harness(
        vec![
            // round 1: KG 检索、生成、知识抽取
            MockReply::Text("no lookup needed".into()),
            MockReply::Text("Cats are wonderful companions!\nimportance: 0.7".into()),
            call(
                "kg_create_knowledge_triple",
                json!({"subject": "alice", "predicate": "LIKES", "object": "cats", "subject_type": "Person", "object_type": "Animal"}),
            ),
            // round 2
            call("kg_get_relationships", json!({"subject": "alice"})),
            MockReply::Text("You told me you like cats.".into()),
            MockReply::Text("nothing to store".into()),
        ],
        Arc::new(StaticRetriever::default()),
    );

    let reply = h.agent.handle_message("alice", "s1", "I like cats").await;
    assert!(reply.success);
    assert_eq!(reply.assistant_text, "Cats are wonderful companions!");
    let report = reply.background.wait().await;
    assert!(report.all_succeeded(), "{report:?}");

    let memory = h.agent.memory();
    let stats = memory.stats("alice").await.unwrap();
    assert_eq!(stats.short_term_count, 2);
    assert_eq!(stats.long_term_count, 2);
    let remembered = memory.get_combined("alice", true, 10).await.unwrap();
    assert_eq!(remembered[0].role, Role::User);
    assert_eq!(remembered[0].content, "I like cats");
    assert_eq!(remembered[1].importance_score, 0.7);

    let likes = h
        .agent
        .graph()
        .get_relationships(&RelationshipFilter::new().subject("alice"), 10)
        .await
        .unwrap();
    assert_eq!(likes.len(), 1);
    assert_eq!(likes[0].predicate.as_str(), "LIKES");

    let reply = h.agent.handle_message("alice", "s1", "What do I like?").await;
    assert!(reply.success);
    assert_eq!(reply.diagnostic_context.round, 2);
    assert!(reply.diagnostic_context.kg_context.contains("LIKES"));
    assert!(reply.diagnostic_context.memory_context.contains("user: I like cats"));
    reply.background.wait().await;

    // 第二轮的 Generate 提示词带上了第一轮的记忆与图谱结果
    let calls = h.llm.calls();
    let prompt = &calls[4].messages[0].content;
    assert!(prompt.contains("user: I like cats"));
    assert!(prompt.contains("LIKES"));
}

#[tokio::test]
async fn test_generate_waits_for_slow_retrieval() {
    let retriever = StaticRetriever::from_texts(["Paris is the capital of France."])
        .with_delay(Duration::from_millis(300));
    let h = harness(
        vec![
            call("kg_search_entities", json!({"keyword": "Paris"})),
            MockReply::Text("Paris.".into()),
        ],
        Arc::new(retriever),
    );
    h.agent
        .graph()
        .upsert_entity("Paris", "City", Default::default())
        .await
        .unwrap();

    let started = Instant::now();
    let reply = h
        .agent
        .handle_message("bob", "s1", "What is the capital of France, Paris?")
        .await;
    assert!(reply.success);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let tasks = &reply.diagnostic_context.tasks;
    assert_eq!(tasks[&TaskKind::RagRetrieve], TaskState::Completed);
    assert_eq!(tasks[&TaskKind::KgSearch], TaskState::Completed);
    assert_eq!(tasks[&TaskKind::Generate], TaskState::Completed);

    let prompt = &h.llm.calls()[1].messages[0].content;
    assert!(prompt.contains("Reference 1: Paris is the capital of France."));
    assert!(prompt.contains("CITY"));
    reply.background.wait().await;
}

#[tokio::test]
async fn test_generation_failure_is_generic_and_not_persisted() {
    let h = harness(
        vec![
            MockReply::Text("no lookup".into()),
            MockReply::Fail("upstream 500: secret details".into()),
        ],
        Arc::new(StaticRetriever::default()),
    );

    let reply = h.agent.handle_message("carol", "s1", "hello").await;
    assert!(!reply.success);
    assert_eq!(reply.assistant_text, GENERIC_ERROR_MESSAGE);
    assert!(!reply.assistant_text.contains("secret"));
    assert!(!reply.background.is_scheduled());
    assert_eq!(
        reply.diagnostic_context.tasks[&TaskKind::PersistMemory],
        TaskState::Skipped
    );

    let stats = h.agent.memory().stats("carol").await.unwrap();
    assert_eq!(stats.short_term_count, 0);
    assert_eq!(stats.long_term_count, 0);
}

#[tokio::test]
async fn test_retrieval_failure_degrades() {
    let h = harness(
        vec![
            MockReply::Text("no lookup".into()),
            MockReply::Text("Hi Dave.".into()),
        ],
        Arc::new(BrokenRetriever),
    );

    let reply = h.agent.handle_message("dave", "s1", "hello there").await;
    assert!(reply.success);
    assert_eq!(reply.assistant_text, "Hi Dave.");
    assert_eq!(reply.diagnostic_context.rag_context, NO_INFO);
    assert_eq!(reply.diagnostic_context.kg_context, NO_INFO);
    assert_eq!(
        reply.diagnostic_context.tasks[&TaskKind::RagRetrieve],
        TaskState::Failed
    );
    let report = reply.background.wait().await;
    assert!(report.all_succeeded());
    assert_eq!(h.agent.memory().stats("dave").await.unwrap().short_term_count, 2);
}

#[tokio::test]
async fn test_long_term_memory_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".into();
    cfg.memory.long_term_db = dir.path().join("long_term.db");
    cfg.memory.short_term_db = Some(dir.path().join("short_term.db"));
    cfg.graph.db_path = dir.path().join("graph.db");
    cfg.session.db_path = Some(dir.path().join("sessions.db"));

    let token = {
        let agent = Agent::from_config(&cfg, Arc::new(StaticRetriever::default())).unwrap();
        let session = agent.sessions().create("erin").await.unwrap();
        let reply = agent
            .handle_authenticated(&session.token, "my favourite colour is green")
            .await
            .unwrap();
        assert!(reply.success);
        assert!(reply.background.wait().await.all_succeeded());
        session.token
    };

    let agent = Agent::from_config(&cfg, Arc::new(StaticRetriever::default())).unwrap();
    let session = agent.sessions().resolve(&token).await.unwrap().unwrap();
    assert_eq!(session.user_id, "erin");
    let remembered = agent.memory().get_combined("erin", true, 10).await.unwrap();
    assert!(remembered
        .iter()
        .any(|t| t.content == "my favourite colour is green"));
}
