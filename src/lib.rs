//! Comb - 带分层记忆与知识图谱的对话编排引擎
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时，对外的 handle_message 入口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 共享错误类型
//! - **graph**: 基于 SQLite 的知识图谱（实体、关系、三元组、路径与邻域查询）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、工具调用循环
//! - **memory**: 短期 / 长期记忆与协调器
//! - **observability**: tracing 初始化
//! - **session**: 会话令牌存储
//! - **tools**: 工具注册表、执行器与知识图谱工具
//! - **workflow**: 对话 DAG、调度引擎与各任务实现

pub mod agent;
pub mod config;
pub mod core;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;
pub mod tools;
pub mod workflow;

pub use agent::{Agent, Reply};
