//! 知识图谱：带类型的实体与有向关系，SQLite 持久化

pub mod label;
pub mod model;
pub mod store;

pub use label::{Label, PropertyKey};
pub use model::{
    BatchReport, Entity, EntityRef, GraphPath, GraphStats, NewEntity, NewRelationship,
    Relationship, RelationshipFilter, Subgraph, Triple,
};
pub use store::GraphStore;
