//! 工具调用循环
//!
//! 显式状态机：AwaitingToolDecision -> ExecutingTools -> AwaitingFinalAnswer -> Done。
//! 最多执行一轮工具；工具失败以错误文本回传给模型而不是中断循环。

use std::sync::Arc;

use super::traits::LlmClient;
use super::types::{ChatMessage, ToolCall, ToolChoice};
use crate::core::{CoreError, Result};
use crate::tools::ToolExecutor;

/// 工具轮数上限
pub const MAX_TOOL_ROUNDS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolLoopPhase {
    AwaitingToolDecision,
    ExecutingTools,
    AwaitingFinalAnswer,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call: ToolCall,
    pub output: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolLoopOutcome {
    /// 模型最终的文本回答（未请求最终回答且调用了工具时为 None）
    pub answer: Option<String>,
    pub tool_results: Vec<ToolResult>,
    pub rounds: usize,
}

impl ToolLoopOutcome {
    /// 成功的工具输出
    pub fn successful_outputs(&self) -> impl Iterator<Item = &str> {
        self.tool_results.iter().filter(|r| r.ok).map(|r| r.output.as_str())
    }
}

pub struct ToolLoop {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    require_tool: bool,
    final_answer: bool,
}

impl ToolLoop {
    pub fn new(llm: Arc<dyn LlmClient>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            llm,
            executor,
            require_tool: false,
            final_answer: true,
        }
    }

    /// 第一次决策时要求模型必须调用工具
    pub fn require_tool(mut self, required: bool) -> Self {
        self.require_tool = required;
        self
    }

    /// 工具执行后是否再请求一次最终回答
    pub fn final_answer(mut self, enabled: bool) -> Self {
        self.final_answer = enabled;
        self
    }

    pub async fn run(&self, mut messages: Vec<ChatMessage>) -> Result<ToolLoopOutcome> {
        let specs = self.executor.specs();
        let mut outcome = ToolLoopOutcome::default();
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut phase = ToolLoopPhase::AwaitingToolDecision;

        while phase != ToolLoopPhase::Done {
            tracing::trace!(?phase, "tool loop");
            phase = match phase {
                ToolLoopPhase::AwaitingToolDecision => {
                    let choice = if self.require_tool {
                        ToolChoice::Required
                    } else {
                        ToolChoice::Auto
                    };
                    let generation = self
                        .llm
                        .generate(&messages, &specs, choice)
                        .await
                        .map_err(CoreError::Generation)?;
                    if generation.has_tool_calls() && outcome.rounds < MAX_TOOL_ROUNDS {
                        messages.push(ChatMessage::assistant(
                            serde_json::to_string(&generation.tool_calls)?,
                        ));
                        pending = generation.tool_calls;
                        ToolLoopPhase::ExecutingTools
                    } else {
                        if self.require_tool && !generation.has_tool_calls() {
                            tracing::debug!("model answered without the required tool call");
                        }
                        outcome.answer = Some(generation.content);
                        ToolLoopPhase::Done
                    }
                }
                ToolLoopPhase::ExecutingTools => {
                    for call in pending.drain(..) {
                        let (output, ok) = match self
                            .executor
                            .execute(&call.name, call.arguments.clone())
                            .await
                        {
                            Ok(output) => (output, true),
                            Err(e) => (format!("error: {e}"), false),
                        };
                        messages.push(ChatMessage::tool(call.id.clone(), output.clone()));
                        outcome.tool_results.push(ToolResult { call, output, ok });
                    }
                    outcome.rounds += 1;
                    if self.final_answer {
                        ToolLoopPhase::AwaitingFinalAnswer
                    } else {
                        ToolLoopPhase::Done
                    }
                }
                ToolLoopPhase::AwaitingFinalAnswer => {
                    let generation = self
                        .llm
                        .generate(&messages, &specs, ToolChoice::None)
                        .await
                        .map_err(CoreError::Generation)?;
                    outcome.answer = Some(generation.content);
                    ToolLoopPhase::Done
                }
                ToolLoopPhase::Done => ToolLoopPhase::Done,
            };
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::llm::{MockLlmClient, MockReply};
    use crate::tools::query_tools;
    use serde_json::json;
    use std::time::Duration;

    async fn executor() -> Arc<ToolExecutor> {
        let graph = Arc::new(GraphStore::open_in_memory().unwrap());
        graph
            .create_knowledge_triple("Alice", "WORKS_AT", "Acme", None, None, Default::default())
            .await
            .unwrap();
        Arc::new(ToolExecutor::new(query_tools(graph), Duration::from_secs(5)))
    }

    fn search_call(id: &str, keyword: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "kg_search_entities".into(),
            arguments: json!({ "keyword": keyword }),
        }
    }

    #[tokio::test]
    async fn test_single_round_with_final_answer() {
        let llm = Arc::new(MockLlmClient::with_replies([
            MockReply::ToolCalls(vec![search_call("c1", "Alice")]),
            MockReply::Text("Alice works at Acme.".into()),
        ]));
        let outcome = ToolLoop::new(llm.clone(), executor().await)
            .run(vec![ChatMessage::user("where does Alice work?")])
            .await
            .unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.answer.as_deref(), Some("Alice works at Acme."));
        assert!(outcome.tool_results[0].ok);
        assert!(outcome.tool_results[0].output.contains("Alice"));

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].choice, ToolChoice::None);
        assert_eq!(calls[1].messages.last().unwrap().tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_required_tool_without_final_answer() {
        let llm = Arc::new(MockLlmClient::with_replies([MockReply::ToolCalls(vec![
            search_call("c1", "Alice"),
            ToolCall {
                id: "c2".into(),
                name: "kg_search_entities".into(),
                arguments: json!({}),
            },
        ])]));
        let outcome = ToolLoop::new(llm.clone(), executor().await)
            .require_tool(true)
            .final_answer(false)
            .run(vec![ChatMessage::user("Alice")])
            .await
            .unwrap();

        assert!(outcome.answer.is_none());
        assert_eq!(outcome.tool_results.len(), 2);
        assert!(!outcome.tool_results[1].ok);
        assert_eq!(outcome.successful_outputs().count(), 1);
        assert_eq!(llm.calls()[0].choice, ToolChoice::Required);
    }

    #[tokio::test]
    async fn test_direct_answer_and_generation_failure() {
        let llm = Arc::new(MockLlmClient::with_replies([
            MockReply::Text("no tools needed".into()),
            MockReply::Fail("rate limited".into()),
        ]));
        let tool_loop = ToolLoop::new(llm, executor().await);
        let outcome = tool_loop.run(vec![ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.answer.as_deref(), Some("no tools needed"));

        let err = tool_loop.run(vec![ChatMessage::user("hi")]).await.unwrap_err();
        assert_eq!(err, CoreError::Generation("rate limited".into()));
    }
}
