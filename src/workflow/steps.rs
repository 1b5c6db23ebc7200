//! 对话工作流中各任务的实现
//!
//! Load-Memory 读取合并历史；RAG / KG 检索填充上下文；Generate 组装提示词并生成回复；
//! Persist-Memory 写入记忆层；Extract-Knowledge 让模型通过写入工具更新知识图谱。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::engine::WorkflowTaskExecutor;
use super::retrieval::{format_references, Retriever};
use super::state::{ConversationState, StatePatch, NO_INFO};
use super::types::TaskKind;
use crate::config::WorkflowSection;
use crate::core::{CoreError, Result};
use crate::graph::GraphStore;
use crate::llm::{ChatMessage, LlmClient, ToolChoice, ToolLoop};
use crate::memory::turn::clamp_score;
use crate::memory::{MemoryCoordinator, Role, Turn};
use crate::tools::{query_tools, write_tools, ToolExecutor};

const KG_SEARCH_PROMPT: &str = "You look up facts in a knowledge graph. \
Use the available tools to find entities and relationships relevant to the user's message. \
Always call at least one tool.";

const EXTRACT_PROMPT: &str = "You maintain a knowledge graph. \
Read the exchange below and store any durable facts (people, organizations, places, preferences) \
as entities and relationships using the available tools. Use UPPER_SNAKE_CASE relationship types. \
If there is nothing worth storing, reply with 'nothing to store'.";

static IMPORTANCE_RE: OnceLock<Regex> = OnceLock::new();

fn importance_re() -> &'static Regex {
    IMPORTANCE_RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|\n)[ \t]*importance[ \t]*:[ \t]*([0-9]+(?:\.[0-9]+)?)\s*$")
            .expect("static importance pattern")
    })
}

/// 拆出回复末尾的 `importance: <float>` 行；没有时使用 default
pub fn split_importance(content: &str, default: f32) -> (String, f32) {
    match importance_re().captures(content) {
        Some(caps) => {
            let score = caps[1].parse::<f32>().map(clamp_score).unwrap_or(default);
            let start = caps.get(0).map(|m| m.start()).unwrap_or(content.len());
            (content[..start].trim_end().to_string(), score)
        }
        None => (content.trim().to_string(), default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    pub history_limit: usize,
    pub retrieval_top_k: usize,
    pub default_importance: f32,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self::from(&WorkflowSection::default())
    }
}

impl From<&WorkflowSection> for StepOptions {
    fn from(cfg: &WorkflowSection) -> Self {
        Self {
            history_limit: cfg.history_limit,
            retrieval_top_k: cfg.retrieval_top_k,
            default_importance: clamp_score(cfg.default_importance),
        }
    }
}

pub struct ConversationSteps {
    memory: Arc<MemoryCoordinator>,
    retriever: Arc<dyn Retriever>,
    llm: Arc<dyn LlmClient>,
    query_tools: Arc<ToolExecutor>,
    write_tools: Arc<ToolExecutor>,
    options: StepOptions,
}

impl ConversationSteps {
    pub fn new(
        memory: Arc<MemoryCoordinator>,
        retriever: Arc<dyn Retriever>,
        llm: Arc<dyn LlmClient>,
        graph: Arc<GraphStore>,
        tool_timeout: Duration,
        options: StepOptions,
    ) -> Self {
        Self {
            memory,
            retriever,
            llm,
            query_tools: Arc::new(ToolExecutor::new(query_tools(graph.clone()), tool_timeout)),
            write_tools: Arc::new(ToolExecutor::new(write_tools(graph), tool_timeout)),
            options,
        }
    }

    async fn load_memory(&self, state: &ConversationState) -> Result<StatePatch> {
        let combined = self
            .memory
            .get_combined(&state.user_id, true, self.options.history_limit)
            .await?;
        let recent = self
            .memory
            .recent(&state.user_id, self.options.history_limit)
            .await?;
        let query = state
            .last_user_message()
            .map(|t| t.content.clone())
            .unwrap_or_else(|| state.query.clone());
        tracing::debug!(
            user_id = %state.user_id,
            combined = combined.len(),
            recent = recent.len(),
            "memory loaded"
        );
        Ok(StatePatch {
            memory_context: Some(MemoryCoordinator::format_context(&combined)),
            short_memory_context: Some(MemoryCoordinator::format_context(&recent)),
            query: Some(query),
            ..StatePatch::default()
        })
    }

    async fn rag_retrieve(&self, state: &ConversationState) -> Result<StatePatch> {
        let documents = self.retriever.retrieve(&state.query).await?;
        let mut documents = self.retriever.rerank(documents, &state.query).await?;
        documents.truncate(self.options.retrieval_top_k);
        if documents.is_empty() {
            return Ok(StatePatch::rag_context(NO_INFO));
        }
        Ok(StatePatch::rag_context(format_references(&documents)))
    }

    async fn kg_search(&self, state: &ConversationState) -> Result<StatePatch> {
        let outcome = ToolLoop::new(self.llm.clone(), self.query_tools.clone())
            .require_tool(true)
            .final_answer(false)
            .run(vec![
                ChatMessage::system(KG_SEARCH_PROMPT),
                ChatMessage::user(state.query.clone()),
            ])
            .await?;

        let findings: Vec<&str> = outcome
            .successful_outputs()
            .filter(|out| !out.trim().is_empty() && *out != "[]" && !out.starts_with("No entity"))
            .collect();
        if findings.is_empty() {
            tracing::debug!(tool_calls = outcome.tool_results.len(), "knowledge graph search found nothing");
            return Ok(StatePatch::kg_context(NO_INFO));
        }
        Ok(StatePatch::kg_context(findings.join("\n")))
    }

    async fn generate(&self, state: &ConversationState) -> Result<StatePatch> {
        let mut messages = vec![ChatMessage::system(system_prompt(state))];
        messages.extend(state.turns.iter().map(|t| match t.role {
            Role::User => ChatMessage::user(t.content.clone()),
            Role::Assistant => ChatMessage::assistant(t.content.clone()),
        }));

        let generation = self
            .llm
            .generate(&messages, &[], ToolChoice::None)
            .await
            .map_err(CoreError::Generation)?;
        let (text, score) = split_importance(&generation.content, self.options.default_importance);
        if text.is_empty() {
            return Err(CoreError::Generation("model returned an empty reply".into()));
        }

        let reply = Turn::assistant(text)
            .with_importance(score)
            .with_metadata("session_id", state.session_id.clone())
            .with_metadata("round", state.round);
        Ok(StatePatch::append_turn(reply))
    }

    async fn persist_memory(&self, state: &ConversationState) -> Result<StatePatch> {
        let score = state
            .assistant_reply()
            .map(|t| t.importance_score)
            .unwrap_or(self.options.default_importance);
        let mut promoted = 0;
        for turn in &state.turns {
            if self.memory.add_turn(&state.user_id, turn.clone(), score).await? {
                promoted += 1;
            }
        }
        tracing::debug!(user_id = %state.user_id, turns = state.turns.len(), promoted, "exchange persisted");
        Ok(StatePatch::empty())
    }

    async fn extract_knowledge(&self, state: &ConversationState) -> Result<StatePatch> {
        let Some(reply) = state.assistant_reply() else {
            return Ok(StatePatch::empty());
        };
        let exchange = format!("User: {}\nAssistant: {}", state.query, reply.content);
        let outcome = ToolLoop::new(self.llm.clone(), self.write_tools.clone())
            .final_answer(false)
            .run(vec![ChatMessage::system(EXTRACT_PROMPT), ChatMessage::user(exchange)])
            .await?;
        let stored = outcome.successful_outputs().count();
        let failed = outcome.tool_results.len() - stored;
        if failed > 0 {
            tracing::warn!(stored, failed, "some knowledge writes failed");
        } else {
            tracing::debug!(stored, "knowledge extracted");
        }
        Ok(StatePatch::empty())
    }
}

fn section(value: &str) -> &str {
    if value.trim().is_empty() || value == NO_INFO {
        "(none)"
    } else {
        value
    }
}

fn system_prompt(state: &ConversationState) -> String {
    format!(
        "You are a helpful assistant. Use the context below when it is relevant to the user's message.\n\n\
         ## Long-term memory\n{}\n\n\
         ## Recent conversation\n{}\n\n\
         ## Knowledge graph\n{}\n\n\
         ## Documents\n{}\n\n\
         After your answer, add one final line `importance: <number between 0 and 1>` \
         rating how worth remembering this exchange is.",
        section(&state.memory_context),
        section(&state.short_memory_context),
        section(&state.kg_context),
        section(&state.rag_context),
    )
}

#[async_trait]
impl WorkflowTaskExecutor for ConversationSteps {
    async fn execute(&self, task: TaskKind, state: Arc<ConversationState>) -> Result<StatePatch> {
        match task {
            TaskKind::LoadMemory => self.load_memory(&state).await,
            TaskKind::RagRetrieve => self.rag_retrieve(&state).await,
            TaskKind::KgSearch => self.kg_search(&state).await,
            TaskKind::Generate => self.generate(&state).await,
            TaskKind::PersistMemory => self.persist_memory(&state).await,
            TaskKind::ExtractKnowledge => self.extract_knowledge(&state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockReply, ToolCall};
    use crate::memory::{ShortTermPolicy, ShortTermStore, SqliteLongTerm};
    use crate::workflow::StaticRetriever;
    use serde_json::json;

    struct Fixture {
        steps: ConversationSteps,
        memory: Arc<MemoryCoordinator>,
        graph: Arc<GraphStore>,
        llm: Arc<MockLlmClient>,
    }

    fn fixture(replies: Vec<MockReply>) -> Fixture {
        let memory = Arc::new(MemoryCoordinator::new(
            ShortTermStore::in_memory(ShortTermPolicy::default()),
            Arc::new(SqliteLongTerm::open_in_memory().unwrap()),
        ));
        let graph = Arc::new(GraphStore::open_in_memory().unwrap());
        let llm = Arc::new(MockLlmClient::with_replies(replies));
        let retriever = Arc::new(StaticRetriever::from_texts([
            "Cats are small domesticated carnivores.",
            "Dogs were domesticated from wolves.",
        ]));
        let steps = ConversationSteps::new(
            memory.clone(),
            retriever,
            llm.clone(),
            graph.clone(),
            Duration::from_secs(5),
            StepOptions {
                retrieval_top_k: 1,
                ..StepOptions::default()
            },
        );
        Fixture { steps, memory, graph, llm }
    }

    #[test]
    fn test_split_importance() {
        assert_eq!(
            split_importance("Cats are great.\nimportance: 0.7", 0.5),
            ("Cats are great.".to_string(), 0.7)
        );
        assert_eq!(
            split_importance("Sure.\n  Importance : 3\n", 0.5),
            ("Sure.".to_string(), 1.0)
        );
        assert_eq!(
            split_importance("The importance: of cats is high", 0.4),
            ("The importance: of cats is high".to_string(), 0.4)
        );
    }

    #[tokio::test]
    async fn test_load_memory_and_rag() {
        let f = fixture(vec![]);
        f.memory
            .add_turn("alice", Turn::user("my name is Alice"), 0.9)
            .await
            .unwrap();
        let state = ConversationState::new("alice", "s1", "tell me about cats", 2);

        let patch = f.steps.load_memory(&state).await.unwrap();
        assert_eq!(patch.memory_context.as_deref(), Some("user: my name is Alice"));
        assert_eq!(patch.query.as_deref(), Some("tell me about cats"));

        let patch = f.steps.rag_retrieve(&state).await.unwrap();
        assert_eq!(
            patch.rag_context.as_deref(),
            Some("Reference 1: Cats are small domesticated carnivores.")
        );

        let miss = ConversationState::new("alice", "s1", "quantum physics", 2);
        let patch = f.steps.rag_retrieve(&miss).await.unwrap();
        assert_eq!(patch.rag_context.as_deref(), Some(NO_INFO));
    }

    #[tokio::test]
    async fn test_kg_search_uses_query_tools() {
        let f = fixture(vec![MockReply::ToolCalls(vec![ToolCall {
            id: "c1".into(),
            name: "kg_get_relationships".into(),
            arguments: json!({"subject": "Alice"}),
        }])]);
        f.graph
            .create_knowledge_triple("Alice", "WORKS_AT", "Acme", None, None, Default::default())
            .await
            .unwrap();
        let state = ConversationState::new("alice", "s1", "where does Alice work?", 1);

        let patch = f.steps.kg_search(&state).await.unwrap();
        let context = patch.kg_context.unwrap();
        assert!(context.contains("WORKS_AT"));
        assert!(context.contains("Acme"));
        assert_eq!(f.llm.calls()[0].choice, ToolChoice::Required);

        // 模型未调用工具时为默认上下文
        let patch = f.steps.kg_search(&state).await.unwrap();
        assert_eq!(patch.kg_context.as_deref(), Some(NO_INFO));
    }

    #[tokio::test]
    async fn test_generate_builds_prompt_and_parses_importance() {
        let f = fixture(vec![
            MockReply::Text("Cats are great.\nimportance: 0.7".into()),
            MockReply::Text("   ".into()),
        ]);
        let mut state = ConversationState::new("alice", "s1", "I like cats", 3);
        state.kg_context = "(PERSON:alice) LIKES cats".into();

        let patch = f.steps.generate(&state).await.unwrap();
        let reply = &patch.new_turns[0];
        assert_eq!(reply.content, "Cats are great.");
        assert_eq!(reply.importance_score, 0.7);
        assert_eq!(reply.metadata["round"], 3);

        let system = &f.llm.calls()[0].messages[0];
        assert!(system.content.contains("## Knowledge graph\n(PERSON:alice) LIKES cats"));
        assert!(system.content.contains("## Documents\n(none)"));

        assert!(matches!(
            f.steps.generate(&state).await,
            Err(CoreError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_promotes_exchange_together() {
        let f = fixture(vec![]);
        let mut state = ConversationState::new("alice", "s1", "I like cats", 1);
        state
            .apply(
                TaskKind::Generate,
                StatePatch::append_turn(Turn::assistant("Noted!").with_importance(0.7)),
            )
            .unwrap();

        f.steps.persist_memory(&state).await.unwrap();
        let stats = f.memory.stats("alice").await.unwrap();
        assert_eq!(stats.short_term_count, 2);
        assert_eq!(stats.long_term_count, 2);
    }

    #[tokio::test]
    async fn test_extract_knowledge_writes_graph() {
        let f = fixture(vec![MockReply::ToolCalls(vec![ToolCall {
            id: "c1".into(),
            name: "kg_create_knowledge_triple".into(),
            arguments: json!({"subject": "alice", "predicate": "LIKES", "object": "cats", "subject_type": "Person"}),
        }])]);
        let mut state = ConversationState::new("alice", "s1", "I like cats", 1);
        state
            .apply(TaskKind::Generate, StatePatch::append_turn(Turn::assistant("Noted!")))
            .unwrap();

        let patch = f.steps.extract_knowledge(&state).await.unwrap();
        assert!(patch.is_empty());
        let stats = f.graph.stats().await.unwrap();
        assert_eq!(stats.relationship_count, 1);
        assert_eq!(f.llm.calls()[0].choice, ToolChoice::Auto);
    }
}
