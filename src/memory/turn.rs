//! Turn：一条用户或助手消息
//!
//! 外部导入的松散 JSON 历史记录经 [`Turn::from_value`] 归一化为该类型
//! （见 `MemoryCoordinator::import_history`），下游只处理强类型字段。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{CoreError, Result};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// 解析角色名，兼容 human / ai 等别名
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            other => Err(CoreError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// 单条对话消息；除 importance_score 外写入后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub importance_score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            importance_score: 0.0,
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_importance(mut self, score: f32) -> Self {
        self.importance_score = clamp_score(score);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 从松散 JSON 记录构建 Turn
    ///
    /// - 角色字段取 `role` 或 `type`，接受 user / human / assistant / ai
    /// - `content` 必填
    /// - `id` 缺省时新生成；`timestamp` 支持 RFC3339 字符串或 Unix 秒，缺省为当前时间
    /// - `importance_score` 缺省 0.0，超出 [0,1] 时截断
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::Validation("turn must be a JSON object".into()))?;

        let role_raw = obj
            .get("role")
            .or_else(|| obj.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Validation("turn is missing role".into()))?;
        let role = Role::parse(role_raw)?;

        let content = obj
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Validation("turn is missing content".into()))?
            .to_string();

        let id = match obj.get("id").and_then(Value::as_str) {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| CoreError::Validation(format!("invalid turn id {raw}: {e}")))?,
            None => Uuid::new_v4(),
        };

        let timestamp = match obj.get("timestamp") {
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CoreError::Validation(format!("invalid timestamp {s}: {e}")))?,
            Some(Value::Number(n)) => n
                .as_f64()
                .and_then(|secs| Utc.timestamp_micros((secs * 1_000_000.0) as i64).single())
                .ok_or_else(|| CoreError::Validation(format!("invalid timestamp {n}")))?,
            Some(Value::Null) | None => Utc::now(),
            Some(other) => {
                return Err(CoreError::Validation(format!("invalid timestamp {other}")));
            }
        };

        let importance_score = obj
            .get("importance_score")
            .and_then(Value::as_f64)
            .map(|s| clamp_score(s as f32))
            .unwrap_or(0.0);

        let metadata = match obj.get("metadata") {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };

        Ok(Self {
            id,
            role,
            content,
            timestamp,
            importance_score,
            metadata,
        })
    }
}

/// 分数截断到 [0,1]；NaN 视为 0
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
