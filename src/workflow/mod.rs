//! 对话工作流：DAG 定义、调度引擎、共享状态与各任务实现

pub mod builder;
pub mod engine;
pub mod graph;
pub mod retrieval;
pub mod state;
pub mod steps;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::{
    BackgroundWrites, EngineLimits, RunOutcome, WorkflowEngine, WorkflowTaskExecutor, WriteReport,
};
pub use graph::WorkflowGraph;
pub use retrieval::{format_references, Document, Retriever, StaticRetriever};
pub use state::{ConversationState, StatePatch, NO_INFO};
pub use steps::{split_importance, ConversationSteps, StepOptions};
pub use types::*;
