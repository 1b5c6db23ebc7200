//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 工具以 JSON 描述注入 system 消息，模型以 `{"tool": "...", "args": {...}}`（或其数组）回复工具调用，
//! 这里解析回 [`ToolCall`]；只接受本次声明过的工具名。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;

use super::traits::LlmClient;
use super::types::{ChatMessage, ChatRole, FinishReason, Generation, ToolCall, ToolChoice, ToolSpec};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout: Duration::from_secs(60),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn to_openai_messages(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> Result<Vec<ChatCompletionRequestMessage>, String> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        let tool_prompt = tool_prompt(tools, choice);
        let has_system = messages.iter().any(|m| m.role == ChatRole::System);
        if !has_system {
            if let Some(prompt) = &tool_prompt {
                out.push(system_message(prompt.clone())?);
            }
        }

        for m in messages {
            let converted = match m.role {
                ChatRole::System => {
                    let content = match &tool_prompt {
                        Some(prompt) => format!("{}\n\n{}", m.content, prompt),
                        None => m.content.clone(),
                    };
                    system_message(content)?
                }
                ChatRole::User => user_message(m.content.clone())?,
                // 工具结果以 user 消息回传，与 JSON 文本协议保持一致
                ChatRole::Tool => user_message(format!(
                    "Tool result ({}):\n{}",
                    m.tool_call_id.as_deref().unwrap_or("call"),
                    m.content
                ))?,
                ChatRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| e.to_string())?,
                ),
            };
            out.push(converted);
        }
        Ok(out)
    }
}

fn system_message(content: String) -> Result<ChatCompletionRequestMessage, String> {
    Ok(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| e.to_string())?,
    ))
}

fn user_message(content: String) -> Result<ChatCompletionRequestMessage, String> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| e.to_string())?,
    ))
}

/// 工具说明段落；choice=None 或没有工具时不注入
fn tool_prompt(tools: &[ToolSpec], choice: ToolChoice) -> Option<String> {
    if tools.is_empty() || choice == ToolChoice::None {
        return None;
    }
    let schema = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
    let rule = match choice {
        ToolChoice::Required => "You MUST call at least one tool before answering.",
        _ => "Call a tool only when it helps; otherwise answer directly.",
    };
    Some(format!(
        "Available tools:\n{schema}\n\n{rule}\n\
         To call tools, reply with JSON only: {{\"tool\": \"<name>\", \"args\": {{...}}}} \
         or a JSON array of such objects."
    ))
}

/// 从模型输出中解析工具调用（```json 代码块或裸 JSON）；未声明的工具名被忽略
pub fn parse_tool_calls(output: &str, tools: &[ToolSpec]) -> Vec<ToolCall> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let start = trimmed.find(['{', '[']);
        let end = trimmed.rfind(['}', ']']);
        match (start, end) {
            (Some(s), Some(e)) if e > s => &trimmed[s..=e],
            _ => return Vec::new(),
        }
    };

    let parsed: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let candidates = match parsed {
        Value::Array(items) => items,
        other => vec![other],
    };

    candidates
        .into_iter()
        .filter_map(|item| {
            let name = item.get("tool")?.as_str()?.to_string();
            if !tools.iter().any(|t| t.name == name) {
                tracing::debug!(tool = %name, "ignoring call to undeclared tool");
                return None;
            }
            let arguments = item.get("args").cloned().unwrap_or(Value::Object(Default::default()));
            Some((name, arguments))
        })
        .enumerate()
        .map(|(i, (name, arguments))| ToolCall {
            id: format!("call_{i}"),
            name,
            arguments,
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> Result<Generation, String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages, tools, choice)?)
            .build()
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| format!("LLM request timed out after {:?}", self.request_timeout))?
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let tool_calls = if choice == ToolChoice::None {
            Vec::new()
        } else {
            parse_tool_calls(&content, tools)
        };
        if tool_calls.is_empty() {
            Ok(Generation {
                content,
                tool_calls,
                finish_reason: FinishReason::Stop,
            })
        } else {
            Ok(Generation::with_tool_calls(tool_calls))
        }
    }
}
