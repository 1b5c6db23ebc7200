//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COMB__*` 覆盖（双下划线表示嵌套，如 `COMB__MEMORY__TTL_SECS=60`）。
//! 图谱标签校验规则固定为 `^[A-Za-z][A-Za-z0-9_]*$`，不在配置中开放。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [memory] 段：短期记忆 TTL / 容量、长期记忆重要性阈值与存储路径
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 短期记忆整键过期时间（秒），每次写入重置
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// 每个用户短期记忆保留的 Turn 条数
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
    /// importance_score >= 阈值时写入长期记忆
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f32,
    /// 短期记忆 SQLite 路径；未设置时只用进程内存储
    pub short_term_db: Option<PathBuf>,
    #[serde(default = "default_long_term_db")]
    pub long_term_db: PathBuf,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_short_term_capacity() -> usize {
    10
}

fn default_importance_threshold() -> f32 {
    0.5
}

fn default_long_term_db() -> PathBuf {
    PathBuf::from("data/long_term.db")
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            short_term_capacity: default_short_term_capacity(),
            importance_threshold: default_importance_threshold(),
            short_term_db: None,
            long_term_db: default_long_term_db(),
        }
    }
}

impl MemorySection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// [graph] 段
#[derive(Debug, Clone, Deserialize)]
pub struct GraphSection {
    #[serde(default = "default_graph_db")]
    pub db_path: PathBuf,
}

fn default_graph_db() -> PathBuf {
    PathBuf::from("data/graph.db")
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            db_path: default_graph_db(),
        }
    }
}

/// [workflow] 段：单次调用截止时间、读任务预算、写任务预算、工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 响应路径（Load-Memory → 检索 → Generate）的总截止时间
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// 单个并行读任务（RAG / KG 检索）的预算，不超过剩余截止时间
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Generate 完成后后台写任务的预算
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 模型未自报重要性时使用的分数
    #[serde(default = "default_importance")]
    pub default_importance: f32,
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,
    /// Load-Memory 读取的合并历史条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_read_timeout_secs() -> u64 {
    20
}

fn default_write_timeout_secs() -> u64 {
    60
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_importance() -> f32 {
    0.5
}

fn default_retrieval_top_k() -> usize {
    4
}

fn default_history_limit() -> usize {
    20
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            default_importance: default_importance(),
            retrieval_top_k: default_retrieval_top_k(),
            history_limit: default_history_limit(),
        }
    }
}

/// [session] 段：登录会话有效期与可选持久化路径
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    pub db_path: Option<PathBuf>,
}

fn default_session_ttl_secs() -> u64 {
    86_400
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            db_path: None,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 COMB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COMB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COMB")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
