//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序弹出预置回复；队列为空时回显最后一条 User 消息。记录每次调用收到的消息与工具，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::traits::LlmClient;
use super::types::{ChatMessage, ChatRole, Generation, ToolCall, ToolChoice, ToolSpec};

/// 一次调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
    pub choice: ToolChoice,
}

/// 预置回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Fail(String),
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 每次生成前先等待 delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> Result<Generation, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
                choice,
            });
        }

        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(MockReply::Text(text)) => Ok(Generation::text(text)),
            Some(MockReply::ToolCalls(calls)) => Ok(Generation::with_tool_calls(calls)),
            Some(MockReply::Fail(e)) => Err(e),
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(Generation::text(format!("Echo from Mock: {last_user}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_scripted_then_echo() {
        let mock = MockLlmClient::with_replies([
            MockReply::Text("first".into()),
            MockReply::Fail("boom".into()),
        ]);
        let msgs = [ChatMessage::user("hello")];

        assert_eq!(mock.generate(&msgs, &[], ToolChoice::Auto).await.unwrap().content, "first");
        assert_eq!(mock.generate(&msgs, &[], ToolChoice::Auto).await.unwrap_err(), "boom");
        assert_eq!(
            mock.generate(&msgs, &[], ToolChoice::None).await.unwrap().content,
            "Echo from Mock: hello"
        );
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(mock.calls()[2].choice, ToolChoice::None);
    }
}
