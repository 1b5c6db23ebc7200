//! 知识图谱存储（SQLite）
//!
//! 实体以 (name, entity_type) 为身份、关系以 (subject, predicate, object) 为身份，
//! 所有写操作都是 upsert：重复执行同一逻辑操作收敛到同一终态。
//! 每个公开操作在单个事务内完成；标签在进入事务前已由 [`Label`] 校验。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::label::Label;
use super::model::*;
use crate::core::sql::{contains_pattern, register_unicode_lower};
use crate::core::{CoreError, Result};

/// 路径查询的最大深度上限
pub const MAX_PATH_DEPTH: usize = 5;
/// 子图展开的最大深度上限
pub const MAX_NETWORK_DEPTH: usize = 3;

pub struct GraphStore {
    conn: Arc<Mutex<Connection>>,
}

const ENTITY_COLUMNS: &str = "id, name, entity_type, properties, created_at, updated_at";

const RELATIONSHIP_SELECT: &str = "SELECT s.name, s.entity_type, r.predicate, o.name, o.entity_type, \
     r.properties, r.created_at, r.updated_at \
     FROM relationships r \
     JOIN entities s ON s.id = r.subject_id \
     JOIN entities o ON o.id = r.object_id";

struct EntityRow {
    id: i64,
    name: String,
    entity_type: String,
    properties: String,
    created_at: i64,
    updated_at: i64,
}

impl EntityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            entity_type: row.get(2)?,
            properties: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            name: self.name,
            entity_type: Label::new(&self.entity_type)?,
            properties: serde_json::from_str(&self.properties)?,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

struct RelationshipRow {
    subject: String,
    subject_type: String,
    predicate: String,
    object: String,
    object_type: String,
    properties: String,
    created_at: i64,
    updated_at: i64,
}

impl RelationshipRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject: row.get(0)?,
            subject_type: row.get(1)?,
            predicate: row.get(2)?,
            object: row.get(3)?,
            object_type: row.get(4)?,
            properties: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_relationship(self) -> Result<Relationship> {
        Ok(Relationship {
            subject: EntityRef {
                name: self.subject,
                entity_type: Label::new(&self.subject_type)?,
            },
            predicate: Label::new(&self.predicate)?,
            object: EntityRef {
                name: self.object,
                entity_type: Label::new(&self.object_type)?,
            },
            properties: serde_json::from_str(&self.properties)?,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| CoreError::Storage(format!("corrupt timestamp {micros}")))
}

/// 当前时间（微秒），保证严格大于上一次的 updated_at
fn next_timestamp(previous: i64) -> i64 {
    Utc::now().timestamp_micros().max(previous + 1)
}

fn find_entity(conn: &Connection, entity: &EntityRef) -> Result<Option<EntityRow>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?1 AND entity_type = ?2"),
            params![entity.name, entity.entity_type.as_str()],
            EntityRow::from_row,
        )
        .optional()?)
}

fn require_entity(conn: &Connection, entity: &EntityRef) -> Result<EntityRow> {
    find_entity(conn, entity)?.ok_or_else(|| CoreError::NotFound(format!("entity {entity}")))
}

fn entity_by_id(conn: &Connection, id: i64) -> Result<Entity> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
        params![id],
        EntityRow::from_row,
    )?
    .into_entity()
}

fn relationship_by_id(conn: &Connection, id: i64) -> Result<Relationship> {
    conn.query_row(
        &format!("{RELATIONSHIP_SELECT} WHERE r.id = ?1"),
        params![id],
        RelationshipRow::from_row,
    )?
    .into_relationship()
}

fn entity_ids_named(conn: &Connection, name: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM entities WHERE name = ?1 ORDER BY id")?;
    let ids = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn merge_properties(stored: &str, incoming: Map<String, Value>) -> Result<Map<String, Value>> {
    let mut merged: Map<String, Value> = serde_json::from_str(stored)?;
    merged.extend(incoming);
    Ok(merged)
}

fn upsert_entity_in(
    conn: &Connection,
    entity: &EntityRef,
    incoming: Map<String, Value>,
) -> Result<(i64, Entity)> {
    match find_entity(conn, entity)? {
        Some(row) => {
            let properties = merge_properties(&row.properties, incoming)?;
            let updated_at = next_timestamp(row.updated_at);
            conn.execute(
                "UPDATE entities SET properties = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&properties)?, updated_at, row.id],
            )?;
            Ok((
                row.id,
                Entity {
                    name: row.name,
                    entity_type: entity.entity_type.clone(),
                    properties,
                    created_at: from_micros(row.created_at)?,
                    updated_at: from_micros(updated_at)?,
                },
            ))
        }
        None => {
            let now = Utc::now().timestamp_micros();
            conn.execute(
                "INSERT INTO entities (name, entity_type, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    entity.name,
                    entity.entity_type.as_str(),
                    serde_json::to_string(&incoming)?,
                    now
                ],
            )?;
            Ok((
                conn.last_insert_rowid(),
                Entity {
                    name: entity.name.clone(),
                    entity_type: entity.entity_type.clone(),
                    properties: incoming,
                    created_at: from_micros(now)?,
                    updated_at: from_micros(now)?,
                },
            ))
        }
    }
}

fn upsert_relationship_in(
    conn: &Connection,
    subject: (i64, &EntityRef),
    predicate: &Label,
    object: (i64, &EntityRef),
    incoming: Map<String, Value>,
) -> Result<Relationship> {
    let existing: Option<(i64, String, i64, i64)> = conn
        .query_row(
            "SELECT id, properties, created_at, updated_at FROM relationships
             WHERE subject_id = ?1 AND predicate = ?2 AND object_id = ?3",
            params![subject.0, predicate.as_str(), object.0],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (properties, created_at, updated_at) = match existing {
        Some((id, stored, created_at, previous)) => {
            let properties = merge_properties(&stored, incoming)?;
            let updated_at = next_timestamp(previous);
            conn.execute(
                "UPDATE relationships SET properties = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&properties)?, updated_at, id],
            )?;
            (properties, created_at, updated_at)
        }
        None => {
            let now = Utc::now().timestamp_micros();
            conn.execute(
                "INSERT INTO relationships
                    (subject_id, predicate, object_id, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    subject.0,
                    predicate.as_str(),
                    object.0,
                    serde_json::to_string(&incoming)?,
                    now
                ],
            )?;
            (incoming, now, now)
        }
    };

    Ok(Relationship {
        subject: subject.1.clone(),
        predicate: predicate.clone(),
        object: object.1.clone(),
        properties,
        created_at: from_micros(created_at)?,
        updated_at: from_micros(updated_at)?,
    })
}

/// 严格模式：两端实体必须已存在
fn create_relationship_in(
    conn: &Connection,
    subject: &EntityRef,
    predicate: &Label,
    object: &EntityRef,
    incoming: Map<String, Value>,
) -> Result<Relationship> {
    let s = require_entity(conn, subject)?;
    let o = require_entity(conn, object)?;
    upsert_relationship_in(conn, (s.id, subject), predicate, (o.id, object), incoming)
}

fn upsert_new_entity(conn: &mut Connection, entity: &NewEntity) -> Result<()> {
    let entity_ref = EntityRef::new(&entity.name, &entity.entity_type)?;
    let tx = conn.transaction()?;
    upsert_entity_in(&tx, &entity_ref, drop_nulls(entity.properties.clone()))?;
    tx.commit()?;
    Ok(())
}

fn create_new_relationship(conn: &mut Connection, rel: &NewRelationship) -> Result<()> {
    let subject = EntityRef::new(&rel.subject, &rel.subject_type)?;
    let object = EntityRef::new(&rel.object, &rel.object_type)?;
    let predicate = Label::new(&rel.predicate)?;
    let tx = conn.transaction()?;
    create_relationship_in(&tx, &subject, &predicate, &object, drop_nulls(rel.properties.clone()))?;
    tx.commit()?;
    Ok(())
}

/// 整批执行失败（阻塞任务中止）时，全部记录计为跳过
fn batch_outcome(result: Result<BatchReport>, total: usize) -> BatchReport {
    result.unwrap_or_else(|e| {
        tracing::error!(error = %e, total, "batch aborted");
        BatchReport {
            succeeded: 0,
            skipped: (0..total).map(|index| (index, e.to_string())).collect(),
        }
    })
}

/// serde_json 值转为可与 json_extract 结果比较的 SQL 值及比较表达式
fn property_condition(path: &str, value: &Value, index: usize) -> (String, Option<SqlValue>) {
    let extract = format!("json_extract(r.properties, {path})");
    match value {
        Value::Null => (format!("{extract} IS NULL"), None),
        Value::Bool(b) => (format!("{extract} = ?{index}"), Some(SqlValue::Integer(*b as i64))),
        Value::Number(n) => {
            let sql_value = match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            };
            (format!("{extract} = ?{index}"), Some(sql_value))
        }
        Value::String(s) => (format!("{extract} = ?{index}"), Some(SqlValue::Text(s.clone()))),
        Value::Array(_) | Value::Object(_) => (
            format!("{extract} = json(?{index})"),
            Some(SqlValue::Text(value.to_string())),
        ),
    }
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::BackendUnavailable(format!("{}: {e}", parent.display())))?;
        }
        tracing::info!(path = %path.display(), "opening graph store");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        register_unicode_lower(&conn)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(name, entity_type)
            );

            CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL REFERENCES entities(id),
                predicate TEXT NOT NULL,
                object_id INTEGER NOT NULL REFERENCES entities(id),
                properties TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(subject_id, predicate, object_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
            CREATE INDEX IF NOT EXISTS idx_rel_subject ON relationships(subject_id);
            CREATE INDEX IF NOT EXISTS idx_rel_object ON relationships(object_id);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 持锁后在阻塞线程池上执行同步 SQLite 操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let mut conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *conn))
            .await
            .map_err(|e| CoreError::TaskAborted(format!("graph store operation: {e}")))?
    }

    /// 按身份 upsert 实体：不存在则创建；存在则合并属性（null 值丢弃）并刷新 updated_at，created_at 不变
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        properties: Map<String, Value>,
    ) -> Result<Entity> {
        let entity = EntityRef::new(name, entity_type)?;
        let properties = drop_nulls(properties);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (_, stored) = upsert_entity_in(&tx, &entity, properties)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// 按名称（可选类型）查找实体；未指定类型且有多个同名实体时返回最早创建的
    pub async fn get_entity(&self, name: &str, entity_type: Option<&str>) -> Result<Option<Entity>> {
        let entity_type = entity_type.map(Label::new).transpose()?;
        let name = name.to_string();
        self.with_conn(move |conn| {
            let row = match &entity_type {
                Some(t) => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?1 AND entity_type = ?2"
                        ),
                        params![name, t.as_str()],
                        EntityRow::from_row,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &format!(
                            "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?1 ORDER BY id LIMIT 1"
                        ),
                        params![name],
                        EntityRow::from_row,
                    )
                    .optional()?,
            };
            row.map(EntityRow::into_entity).transpose()
        })
        .await
    }

    /// 名称子串匹配（不区分大小写）
    pub async fn search_entities(
        &self,
        keyword: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let entity_type = entity_type.map(Label::new).transpose()?;
        let pattern = contains_pattern(keyword.trim());
        let limit = limit as i64;
        self.with_conn(move |conn| {
            let rows = match &entity_type {
                Some(t) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {ENTITY_COLUMNS} FROM entities
                         WHERE unicode_lower(name) LIKE ?1 ESCAPE '\\' AND entity_type = ?2
                         ORDER BY name, entity_type LIMIT ?3"
                    ))?;
                    let rows = stmt
                        .query_map(params![pattern, t.as_str(), limit], EntityRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {ENTITY_COLUMNS} FROM entities
                         WHERE unicode_lower(name) LIKE ?1 ESCAPE '\\'
                         ORDER BY name, entity_type LIMIT ?2"
                    ))?;
                    let rows = stmt
                        .query_map(params![pattern, limit], EntityRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            rows.into_iter().map(EntityRow::into_entity).collect()
        })
        .await
    }

    /// 删除实体；cascade=false 且仍有关联关系时失败，返回删除的关系数
    pub async fn delete_entity(&self, name: &str, entity_type: &str, cascade: bool) -> Result<usize> {
        let entity = EntityRef::new(name, entity_type)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let row = require_entity(&tx, &entity)?;
            let incident: i64 = tx.query_row(
                "SELECT COUNT(*) FROM relationships WHERE subject_id = ?1 OR object_id = ?1",
                params![row.id],
                |r| r.get(0),
            )?;
            if incident > 0 && !cascade {
                return Err(CoreError::Validation(format!(
                    "entity {entity} still has {incident} relationships"
                )));
            }
            tx.execute(
                "DELETE FROM relationships WHERE subject_id = ?1 OR object_id = ?1",
                params![row.id],
            )?;
            tx.execute("DELETE FROM entities WHERE id = ?1", params![row.id])?;
            tx.commit()?;
            tracing::debug!(entity = %entity, removed_relationships = incident, "entity deleted");
            Ok(incident as usize)
        })
        .await
    }

    /// 严格模式创建关系：任一端点不存在时返回 NotFound；已存在时合并属性
    pub async fn create_relationship(
        &self,
        subject: &EntityRef,
        predicate: &str,
        object: &EntityRef,
        properties: Map<String, Value>,
    ) -> Result<Relationship> {
        let predicate = Label::new(predicate)?;
        let properties = drop_nulls(properties);
        let (subject, object) = (subject.clone(), object.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let rel = create_relationship_in(&tx, &subject, &predicate, &object, properties)?;
            tx.commit()?;
            Ok(rel)
        })
        .await
    }

    /// 合并已存在关系的属性；关系不存在时返回 NotFound
    pub async fn update_relationship(
        &self,
        subject: &EntityRef,
        predicate: &str,
        object: &EntityRef,
        properties: Map<String, Value>,
    ) -> Result<Relationship> {
        let predicate = Label::new(predicate)?;
        let properties = drop_nulls(properties);
        let (subject, object) = (subject.clone(), object.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let s = require_entity(&tx, &subject)?;
            let o = require_entity(&tx, &object)?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM relationships WHERE subject_id = ?1 AND predicate = ?2 AND object_id = ?3",
                    params![s.id, predicate.as_str(), o.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(CoreError::NotFound(format!(
                    "relationship {subject}-[{predicate}]->{object}"
                )));
            }
            let rel = upsert_relationship_in(&tx, (s.id, &subject), &predicate, (o.id, &object), properties)?;
            tx.commit()?;
            Ok(rel)
        })
        .await
    }

    /// 删除关系，返回是否存在
    pub async fn delete_relationship(
        &self,
        subject: &EntityRef,
        predicate: &str,
        object: &EntityRef,
    ) -> Result<bool> {
        let predicate = Label::new(predicate)?;
        let (subject, object) = (subject.clone(), object.clone());
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM relationships
                 WHERE subject_id = (SELECT id FROM entities WHERE name = ?1 AND entity_type = ?2)
                   AND predicate = ?3
                   AND object_id = (SELECT id FROM entities WHERE name = ?4 AND entity_type = ?5)",
                params![
                    subject.name,
                    subject.entity_type.as_str(),
                    predicate.as_str(),
                    object.name,
                    object.entity_type.as_str()
                ],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    /// 条件查询关系（全部条件 AND）
    pub async fn get_relationships(
        &self,
        filter: &RelationshipFilter,
        limit: usize,
    ) -> Result<Vec<Relationship>> {
        let mut sql = format!("{RELATIONSHIP_SELECT} WHERE 1 = 1");
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(subject) = &filter.subject {
            values.push(SqlValue::Text(subject.clone()));
            sql.push_str(&format!(" AND s.name = ?{}", values.len()));
        }
        if let Some(object) = &filter.object {
            values.push(SqlValue::Text(object.clone()));
            sql.push_str(&format!(" AND o.name = ?{}", values.len()));
        }
        if let Some(predicate) = &filter.predicate {
            values.push(SqlValue::Text(predicate.as_str().to_string()));
            sql.push_str(&format!(" AND r.predicate = ?{}", values.len()));
        }
        for (key, value) in &filter.properties {
            let (condition, bound) = property_condition(&key.json_path(), value, values.len() + 1);
            sql.push_str(" AND ");
            sql.push_str(&condition);
            if let Some(bound) = bound {
                values.push(bound);
            }
        }
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" ORDER BY r.id LIMIT ?{}", values.len()));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), RelationshipRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RelationshipRow::into_relationship).collect()
        })
        .await
    }

    /// 批量 upsert 实体；每条记录独立事务，单条失败记录日志后跳过
    pub async fn batch_upsert_entities(&self, entities: Vec<NewEntity>) -> BatchReport {
        let total = entities.len();
        let result = self
            .with_conn(move |conn| {
                let mut report = BatchReport::default();
                for (index, entity) in entities.into_iter().enumerate() {
                    match upsert_new_entity(conn, &entity) {
                        Ok(()) => report.succeeded += 1,
                        Err(e) => {
                            tracing::warn!(index, name = %entity.name, error = %e, "skipping entity in batch");
                            report.skipped.push((index, e.to_string()));
                        }
                    }
                }
                Ok(report)
            })
            .await;
        batch_outcome(result, total)
    }

    /// 批量创建关系（严格模式）；每条记录独立事务，单条失败记录日志后跳过
    pub async fn batch_create_relationships(&self, relationships: Vec<NewRelationship>) -> BatchReport {
        let total = relationships.len();
        let result = self
            .with_conn(move |conn| {
                let mut report = BatchReport::default();
                for (index, rel) in relationships.into_iter().enumerate() {
                    match create_new_relationship(conn, &rel) {
                        Ok(()) => report.succeeded += 1,
                        Err(e) => {
                            tracing::warn!(
                                index,
                                subject = %rel.subject,
                                predicate = %rel.predicate,
                                object = %rel.object,
                                error = %e,
                                "skipping relationship in batch"
                            );
                            report.skipped.push((index, e.to_string()));
                        }
                    }
                }
                Ok(report)
            })
            .await;
        batch_outcome(result, total)
    }

    /// 知识三元组：先 upsert 两个端点（默认类型 ENTITY），再 upsert 关系
    pub async fn create_knowledge_triple(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        subject_type: Option<&str>,
        object_type: Option<&str>,
        properties: Map<String, Value>,
    ) -> Result<Relationship> {
        let subject = EntityRef::new(subject, subject_type.unwrap_or(Label::DEFAULT_ENTITY))?;
        let object = EntityRef::new(object, object_type.unwrap_or(Label::DEFAULT_ENTITY))?;
        let predicate = Label::new(predicate)?;
        let properties = drop_nulls(properties);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (s_id, _) = upsert_entity_in(&tx, &subject, Map::new())?;
            let (o_id, _) = upsert_entity_in(&tx, &object, Map::new())?;
            let rel = upsert_relationship_in(&tx, (s_id, &subject), &predicate, (o_id, &object), properties)?;
            tx.commit()?;
            Ok(rel)
        })
        .await
    }

    /// 批量导入三元组：先 upsert 所有出现过的实体（未映射类型用 ENTITY），再创建全部关系
    ///
    /// 返回是否全部成功；无效记录被跳过并记录日志。
    pub async fn import_triples(
        &self,
        triples: &[Triple],
        type_map: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let type_of = |name: &str| -> String {
            type_map
                .and_then(|m| m.get(name))
                .cloned()
                .unwrap_or_else(|| Label::DEFAULT_ENTITY.to_string())
        };

        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        for triple in triples {
            for name in [&triple.subject, &triple.object] {
                let name = name.trim();
                if seen.insert(name.to_string()) {
                    entities.push(NewEntity {
                        name: name.to_string(),
                        entity_type: type_of(name),
                        properties: Map::new(),
                    });
                }
            }
        }

        let relationships: Vec<NewRelationship> = triples
            .iter()
            .map(|t| NewRelationship {
                subject: t.subject.trim().to_string(),
                subject_type: type_of(t.subject.trim()),
                predicate: t.predicate.clone(),
                object: t.object.trim().to_string(),
                object_type: type_of(t.object.trim()),
                properties: Map::new(),
            })
            .collect();

        let entity_report = self.batch_upsert_entities(entities).await;
        let relationship_report = self.batch_create_relationships(relationships).await;
        tracing::info!(
            triples = triples.len(),
            entities = entity_report.succeeded,
            relationships = relationship_report.succeeded,
            skipped = entity_report.skipped.len() + relationship_report.skipped.len(),
            "triples imported"
        );
        Ok(entity_report.all_succeeded() && relationship_report.all_succeeded())
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        self.with_conn(|conn| {
            let entity_count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
            let relationship_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM relationships", [], |r| r.get(0))?;
            let mut stmt =
                conn.prepare("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")?;
            let type_distribution = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
                .collect::<rusqlite::Result<_>>()?;
            Ok(GraphStats {
                entity_count: entity_count as usize,
                relationship_count: relationship_count as usize,
                type_distribution,
            })
        })
        .await
    }

    /// 沿有向边查找 start 到 end 的简单路径（广度优先，最短的在前）
    pub async fn find_paths(
        &self,
        start: &str,
        end: &str,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let max_depth = max_depth.clamp(1, MAX_PATH_DEPTH);
        let (start, end) = (start.to_string(), end.to_string());
        self.with_conn(move |conn| {
            let targets: HashSet<i64> = entity_ids_named(conn, &end)?.into_iter().collect();
            let mut queue: VecDeque<(i64, Vec<i64>, Vec<i64>)> = entity_ids_named(conn, &start)?
                .into_iter()
                .map(|id| (id, Vec::new(), vec![id]))
                .collect();
            let mut found: Vec<Vec<i64>> = Vec::new();
            let mut edges_stmt = conn.prepare(
                "SELECT id, object_id FROM relationships WHERE subject_id = ?1 ORDER BY id",
            )?;

            'search: while let Some((node, edges, visited)) = queue.pop_front() {
                if edges.len() >= max_depth {
                    continue;
                }
                let next: Vec<(i64, i64)> = edges_stmt
                    .query_map(params![node], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<_>>()?;
                for (edge_id, neighbor) in next {
                    if visited.contains(&neighbor) {
                        continue;
                    }
                    let mut path = edges.clone();
                    path.push(edge_id);
                    if targets.contains(&neighbor) {
                        found.push(path);
                        if found.len() >= limit {
                            break 'search;
                        }
                        continue;
                    }
                    let mut seen = visited.clone();
                    seen.push(neighbor);
                    queue.push_back((neighbor, path, seen));
                }
            }
            drop(edges_stmt);

            found
                .into_iter()
                .map(|edge_ids| {
                    let relationships = edge_ids
                        .into_iter()
                        .map(|id| relationship_by_id(conn, id))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(GraphPath { relationships })
                })
                .collect()
        })
        .await
    }

    /// 与 a、b 都直接相连（任一方向）的实体
    pub async fn common_neighbors(&self, a: &str, b: &str) -> Result<Vec<Entity>> {
        let (a, b) = (a.to_string(), b.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "WITH na AS (
                    SELECT r.object_id AS nid FROM relationships r
                        JOIN entities e ON e.id = r.subject_id WHERE e.name = ?1
                    UNION
                    SELECT r.subject_id FROM relationships r
                        JOIN entities e ON e.id = r.object_id WHERE e.name = ?1
                 ),
                 nb AS (
                    SELECT r.object_id AS nid FROM relationships r
                        JOIN entities e ON e.id = r.subject_id WHERE e.name = ?2
                    UNION
                    SELECT r.subject_id FROM relationships r
                        JOIN entities e ON e.id = r.object_id WHERE e.name = ?2
                 )
                 SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE id IN (SELECT nid FROM na INTERSECT SELECT nid FROM nb)
                   AND name NOT IN (?1, ?2)
                 ORDER BY name, entity_type"
            ))?;
            let rows = stmt
                .query_map(params![a, b], EntityRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(EntityRow::into_entity).collect()
        })
        .await
    }

    /// 以 name 为中心、depth 跳以内（不分方向）的子图
    pub async fn entity_network(&self, name: &str, depth: usize) -> Result<Subgraph> {
        let depth = depth.clamp(1, MAX_NETWORK_DEPTH);
        let name = name.to_string();
        self.with_conn(move |conn| {
            let roots = entity_ids_named(conn, &name)?;
            if roots.is_empty() {
                return Err(CoreError::NotFound(format!("entity named {name}")));
            }
            let mut nodes: BTreeSet<i64> = roots.iter().copied().collect();
            let mut edges: BTreeSet<i64> = BTreeSet::new();
            let mut frontier = roots;
            let mut stmt = conn.prepare(
                "SELECT id, subject_id, object_id FROM relationships
                 WHERE subject_id = ?1 OR object_id = ?1",
            )?;
            for _ in 0..depth {
                let mut next = Vec::new();
                for node in &frontier {
                    let incident: Vec<(i64, i64, i64)> = stmt
                        .query_map(params![node], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                        .collect::<rusqlite::Result<_>>()?;
                    for (edge, s, o) in incident {
                        edges.insert(edge);
                        for other in [s, o] {
                            if nodes.insert(other) {
                                next.push(other);
                            }
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
            drop(stmt);

            Ok(Subgraph {
                entities: nodes
                    .into_iter()
                    .map(|id| entity_by_id(conn, id))
                    .collect::<Result<_>>()?,
                relationships: edges
                    .into_iter()
                    .map(|id| relationship_by_id(conn, id))
                    .collect::<Result<_>>()?,
            })
        })
        .await
    }
}
