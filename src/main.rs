//! Comb 命令行入口
//!
//! 初始化日志、按配置组装 Agent，逐行读取标准输入并打印回复。
//! 设置 COMB_HISTORY 时先把该 JSON 文件（记录数组）导入当前用户的记忆。

use std::sync::Arc;

use anyhow::Context;
use comb::config::load_config;
use comb::workflow::StaticRetriever;
use comb::Agent;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    comb::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let agent = Agent::from_config(&cfg, Arc::new(StaticRetriever::default()))
        .context("Failed to create agent")?;

    let user_id = std::env::var("COMB_USER").unwrap_or_else(|_| "local".to_string());
    if let Ok(path) = std::env::var("COMB_HISTORY") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read history file {path}"))?;
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&raw).context("History file must be a JSON array")?;
        let report = agent
            .memory()
            .import_history(&user_id, &records)
            .await
            .context("Failed to import history")?;
        tracing::info!(imported = report.imported, skipped = report.skipped.len(), "history loaded");
    }
    let session = agent
        .sessions()
        .create(&user_id)
        .await
        .context("Failed to create session")?;
    tracing::info!(user_id = %user_id, session_id = %session.session_id, "session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        let reply = agent
            .handle_authenticated(&session.token, line)
            .await
            .context("Session rejected")?;
        println!("{}", reply.assistant_text);
        // 退出前保证本轮记忆写完
        let report = reply.background.wait().await;
        if !report.all_succeeded() {
            tracing::warn!(failed = ?report.failed, timed_out = ?report.timed_out, "background writes incomplete");
        }
    }

    agent.end_session(&session.token).await.ok();
    Ok(())
}
