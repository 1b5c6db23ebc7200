pub mod executor;
pub mod knowledge_graph;
pub mod registry;

pub use executor::ToolExecutor;
pub use knowledge_graph::{query_tools, write_tools};
pub use registry::{Tool, ToolRegistry};
