//! 图谱数据类型

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::label::{Label, PropertyKey};
use crate::core::{CoreError, Result};

/// 实体：身份为 (name, entity_type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: Label,
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            name: self.name.clone(),
            entity_type: self.entity_type.clone(),
        }
    }
}

/// 实体引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub name: String,
    pub entity_type: Label,
}

impl EntityRef {
    pub fn new(name: &str, entity_type: &str) -> Result<Self> {
        Ok(Self {
            name: validate_name(name)?,
            entity_type: Label::new(entity_type)?,
        })
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{})", self.entity_type, self.name)
    }
}

/// 有向关系：身份为 (subject, predicate, object)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub subject: EntityRef,
    pub predicate: Label,
    pub object: EntityRef,
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// get_relationships 的过滤条件；全部可选，按 AND 组合
#[derive(Debug, Clone, Default)]
pub struct RelationshipFilter {
    pub subject: Option<String>,
    pub object: Option<String>,
    pub predicate: Option<Label>,
    pub properties: Vec<(PropertyKey, Value)>,
}

impl RelationshipFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, name: impl Into<String>) -> Self {
        self.subject = Some(name.into());
        self
    }

    pub fn object(mut self, name: impl Into<String>) -> Self {
        self.object = Some(name.into());
        self
    }

    pub fn predicate(mut self, predicate: Label) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn property(mut self, key: PropertyKey, value: impl Into<Value>) -> Self {
        self.properties.push((key, value.into()));
        self
    }
}

/// 图谱统计
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relationship_count: usize,
    /// 实体类型 -> 数量
    pub type_distribution: BTreeMap<String, usize>,
}

/// 三元组 (subject, predicate, object)，名称未校验
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// 批量写入实体的输入
#[derive(Debug, Clone, Deserialize)]
pub struct NewEntity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// 批量写入关系的输入
#[derive(Debug, Clone, Deserialize)]
pub struct NewRelationship {
    pub subject: String,
    pub subject_type: String,
    pub predicate: String,
    pub object: String,
    pub object_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// 批量操作结果：成功条数与被跳过的记录（下标 + 原因）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: Vec<(usize, String)>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// 一条有向路径（按边顺序）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphPath {
    pub relationships: Vec<Relationship>,
}

impl GraphPath {
    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }
}

/// 以某实体为中心的子图
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation("entity name must not be empty".into()));
    }
    Ok(name.to_string())
}

/// 丢弃值为 null 的属性
pub(crate) fn drop_nulls(properties: Map<String, Value>) -> Map<String, Value> {
    properties.into_iter().filter(|(_, v)| !v.is_null()).collect()
}
