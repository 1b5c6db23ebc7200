//! 知识图谱工具
//!
//! 查询组（kg_search_entities / kg_get_entity / kg_get_relationships / kg_graph_stats）供检索阶段使用，
//! 写入组（kg_create_entity / kg_create_relationship / kg_create_knowledge_triple / kg_import_triples）供知识抽取使用。
//! 参数结构由 schemars 生成 JSON Schema。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::{EntityRef, GraphStore, Label, PropertyKey, RelationshipFilter, Triple};
use crate::tools::{Tool, ToolRegistry};

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

fn default_limit() -> usize {
    20
}

/// 查询组工具
pub fn query_tools(graph: Arc<GraphStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SearchEntitiesTool::new(graph.clone()));
    registry.register(GetEntityTool::new(graph.clone()));
    registry.register(GetRelationshipsTool::new(graph.clone()));
    registry.register(GraphStatsTool::new(graph));
    registry
}

/// 写入组工具
pub fn write_tools(graph: Arc<GraphStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(CreateEntityTool::new(graph.clone()));
    registry.register(CreateRelationshipTool::new(graph.clone()));
    registry.register(CreateTripleTool::new(graph.clone()));
    registry.register(ImportTriplesTool::new(graph));
    registry
}

macro_rules! graph_tool {
    ($name:ident) => {
        pub struct $name {
            graph: Arc<GraphStore>,
        }

        impl $name {
            pub fn new(graph: Arc<GraphStore>) -> Self {
                Self { graph }
            }
        }
    };
}

graph_tool!(SearchEntitiesTool);
graph_tool!(GetEntityTool);
graph_tool!(GetRelationshipsTool);
graph_tool!(GraphStatsTool);
graph_tool!(CreateEntityTool);
graph_tool!(CreateRelationshipTool);
graph_tool!(CreateTripleTool);
graph_tool!(ImportTriplesTool);

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchEntitiesArgs {
    /// 名称关键字（子串，不区分大小写）
    keyword: String,
    /// 限定实体类型
    entity_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[async_trait]
impl Tool for SearchEntitiesTool {
    fn name(&self) -> &str {
        "kg_search_entities"
    }

    fn description(&self) -> &str {
        "Search knowledge graph entities whose name contains a keyword."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SearchEntitiesArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SearchEntitiesArgs = parse_args(args)?;
        let entities = self
            .graph
            .search_entities(&args.keyword, args.entity_type.as_deref(), args.limit)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&entities)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetEntityArgs {
    name: String,
    entity_type: Option<String>,
}

#[async_trait]
impl Tool for GetEntityTool {
    fn name(&self) -> &str {
        "kg_get_entity"
    }

    fn description(&self) -> &str {
        "Fetch one entity by exact name, optionally restricted to a type."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GetEntityArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: GetEntityArgs = parse_args(args)?;
        match self
            .graph
            .get_entity(&args.name, args.entity_type.as_deref())
            .await
            .map_err(|e| e.to_string())?
        {
            Some(entity) => to_json(&entity),
            None => Ok(format!("No entity named {}", args.name)),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetRelationshipsArgs {
    subject: Option<String>,
    object: Option<String>,
    #[serde(alias = "predicate")]
    relationship_type: Option<String>,
    /// 关系属性等值过滤
    #[serde(default)]
    properties: HashMap<String, Value>,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[async_trait]
impl Tool for GetRelationshipsTool {
    fn name(&self) -> &str {
        "kg_get_relationships"
    }

    fn description(&self) -> &str {
        "List relationships filtered by subject name, object name, predicate and property values."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GetRelationshipsArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: GetRelationshipsArgs = parse_args(args)?;
        let mut filter = RelationshipFilter::new();
        filter.subject = args.subject;
        filter.object = args.object;
        if let Some(predicate) = args.relationship_type {
            filter = filter.predicate(Label::new(&predicate).map_err(|e| e.to_string())?);
        }
        for (key, value) in args.properties {
            filter = filter.property(PropertyKey::new(&key).map_err(|e| e.to_string())?, value);
        }
        let relationships = self
            .graph
            .get_relationships(&filter, args.limit)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&relationships)
    }
}

#[async_trait]
impl Tool for GraphStatsTool {
    fn name(&self) -> &str {
        "kg_graph_stats"
    }

    fn description(&self) -> &str {
        "Entity and relationship counts plus the entity type distribution."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let stats = self.graph.stats().await.map_err(|e| e.to_string())?;
        to_json(&stats)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateEntityArgs {
    name: String,
    entity_type: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[async_trait]
impl Tool for CreateEntityTool {
    fn name(&self) -> &str {
        "kg_create_entity"
    }

    fn description(&self) -> &str {
        "Create or update an entity identified by (name, entity_type); properties are merged."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<CreateEntityArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CreateEntityArgs = parse_args(args)?;
        let entity = self
            .graph
            .upsert_entity(&args.name, &args.entity_type, args.properties)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Stored entity {}", entity.reference()))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateRelationshipArgs {
    subject: String,
    subject_type: String,
    #[serde(alias = "predicate")]
    relationship_type: String,
    object: String,
    object_type: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[async_trait]
impl Tool for CreateRelationshipTool {
    fn name(&self) -> &str {
        "kg_create_relationship"
    }

    fn description(&self) -> &str {
        "Create a relationship between two existing entities; fails if either entity is missing."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<CreateRelationshipArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CreateRelationshipArgs = parse_args(args)?;
        let subject = EntityRef::new(&args.subject, &args.subject_type).map_err(|e| e.to_string())?;
        let object = EntityRef::new(&args.object, &args.object_type).map_err(|e| e.to_string())?;
        let rel = self
            .graph
            .create_relationship(&subject, &args.relationship_type, &object, args.properties)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Stored {}-[{}]->{}", rel.subject, rel.predicate, rel.object))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateTripleArgs {
    subject: String,
    predicate: String,
    object: String,
    /// 缺省为 ENTITY
    subject_type: Option<String>,
    /// 缺省为 ENTITY
    object_type: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[async_trait]
impl Tool for CreateTripleTool {
    fn name(&self) -> &str {
        "kg_create_knowledge_triple"
    }

    fn description(&self) -> &str {
        "Store a (subject, predicate, object) fact, creating both entities if needed."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<CreateTripleArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CreateTripleArgs = parse_args(args)?;
        let rel = self
            .graph
            .create_knowledge_triple(
                &args.subject,
                &args.predicate,
                &args.object,
                args.subject_type.as_deref(),
                args.object_type.as_deref(),
                args.properties,
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Stored {}-[{}]->{}", rel.subject, rel.predicate, rel.object))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ImportTriplesArgs {
    /// [subject, predicate, object] 列表
    triples: Vec<(String, String, String)>,
    /// 实体名 -> 实体类型；未列出的实体使用 ENTITY
    type_map: Option<HashMap<String, String>>,
}

#[async_trait]
impl Tool for ImportTriplesTool {
    fn name(&self) -> &str {
        "kg_import_triples"
    }

    fn description(&self) -> &str {
        "Bulk import (subject, predicate, object) triples; entities are created before relationships."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ImportTriplesArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ImportTriplesArgs = parse_args(args)?;
        let triples: Vec<Triple> = args
            .triples
            .into_iter()
            .map(|(subject, predicate, object)| Triple::new(subject, predicate, object))
            .collect();
        let complete = self
            .graph
            .import_triples(&triples, args.type_map.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        if complete {
            Ok(format!("Imported {} triples", triples.len()))
        } else {
            Ok(format!("Imported {} triples with some records skipped", triples.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> Arc<GraphStore> {
        Arc::new(GraphStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_tool_sets() {
        let g = graph();
        assert_eq!(
            query_tools(g.clone()).tool_names(),
            vec!["kg_get_entity", "kg_get_relationships", "kg_graph_stats", "kg_search_entities"]
        );
        let specs = write_tools(g).specs();
        assert_eq!(specs.len(), 4);
        let triple = specs.iter().find(|s| s.name == "kg_create_knowledge_triple").unwrap();
        assert!(triple.parameters["properties"]["subject"].is_object());
    }

    #[tokio::test]
    async fn test_write_then_query() {
        let g = graph();
        let writes = write_tools(g.clone());
        let reads = query_tools(g.clone());

        writes
            .execute(
                "kg_create_knowledge_triple",
                json!({"subject": "Alice", "predicate": "works_at", "object": "Acme", "object_type": "Company"}),
            )
            .await
            .unwrap();
        writes
            .execute(
                "kg_create_entity",
                json!({"name": "Alice", "entity_type": "ENTITY", "properties": {"role": "engineer"}}),
            )
            .await
            .unwrap();

        let found = reads
            .execute("kg_search_entities", json!({"keyword": "ali"}))
            .await
            .unwrap();
        let found: Value = serde_json::from_str(&found).unwrap();
        assert_eq!(found[0]["properties"]["role"], "engineer");

        let rels = reads
            .execute("kg_get_relationships", json!({"subject": "Alice", "relationship_type": "WORKS_AT"}))
            .await
            .unwrap();
        let rels: Value = serde_json::from_str(&rels).unwrap();
        assert_eq!(rels[0]["object"]["name"], "Acme");
        assert_eq!(rels[0]["object"]["entity_type"], "COMPANY");

        let missing = reads
            .execute("kg_get_entity", json!({"name": "Bob"}))
            .await
            .unwrap();
        assert_eq!(missing, "No entity named Bob");
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_errors() {
        let g = graph();
        let writes = write_tools(g.clone());
        assert!(writes
            .execute("kg_create_entity", json!({"name": "X", "entity_type": "bad type"}))
            .await
            .is_err());
        assert!(writes
            .execute(
                "kg_create_relationship",
                json!({"subject": "A", "subject_type": "T", "relationship_type": "P", "object": "B", "object_type": "T"}),
            )
            .await
            .is_err());
        assert!(query_tools(g).execute("kg_search_entities", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_import_tool() {
        let g = graph();
        let out = write_tools(g.clone())
            .execute(
                "kg_import_triples",
                json!({"triples": [["Alice", "knows", "Bob"]], "type_map": {"Alice": "Person"}}),
            )
            .await
            .unwrap();
        assert_eq!(out, "Imported 1 triples");
        let stats = g.stats().await.unwrap();
        assert_eq!(stats.type_distribution.get("PERSON"), Some(&1));
        assert_eq!(stats.type_distribution.get("ENTITY"), Some(&1));
    }
}
