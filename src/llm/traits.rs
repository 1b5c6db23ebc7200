//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：给定消息、可用工具与工具策略，返回文本或工具调用。

use async_trait::async_trait;

use super::types::{ChatMessage, Generation, ToolChoice, ToolSpec};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 一次生成；tools 为空时等价于纯文本补全
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> Result<Generation, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
