//! LLM 层：与后端无关的消息类型、客户端抽象与实现（OpenAI 兼容 / Mock）、工具调用循环

pub mod mock;
pub mod openai;
pub mod tool_loop;
pub mod traits;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;

pub use mock::{MockLlmClient, MockReply, RecordedCall};
pub use openai::{OpenAiClient, TokenUsage};
pub use tool_loop::{ToolLoop, ToolLoopOutcome, ToolLoopPhase, ToolResult, MAX_TOOL_ROUNDS};
pub use traits::LlmClient;
pub use types::{ChatMessage, ChatRole, FinishReason, Generation, ToolCall, ToolChoice, ToolSpec};

/// 按配置创建 LLM 客户端；provider 为 openai 但未设置 OPENAI_API_KEY 时回退到 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "openai" && has_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, None)
                .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request)),
        )
    } else {
        if provider != "mock" {
            tracing::warn!(provider = %provider, "No API key set or provider unknown, using Mock LLM");
        }
        Arc::new(MockLlmClient::new())
    }
}
