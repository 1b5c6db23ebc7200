//! 文档检索协作者
//!
//! 向量检索与重排序在本 crate 之外实现；这里只定义接口和一个进程内的关键词检索器。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<Document>>;

    /// 默认保持原顺序
    async fn rerank(&self, documents: Vec<Document>, _query: &str) -> Result<Vec<Document>> {
        Ok(documents)
    }
}

/// `Reference {i}: {content}`，以空行分隔
pub fn format_references(documents: &[Document]) -> String {
    documents
        .iter()
        .enumerate()
        .map(|(i, d)| format!("Reference {}: {}", i + 1, d.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 进程内文档列表 + 关键词重叠打分（大小写不敏感）
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    documents: Vec<Document>,
    delay: Option<Duration>,
}

impl StaticRetriever {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            delay: None,
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(Document::new).collect())
    }

    /// 每次检索前等待 delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Document>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let wanted = keywords(query);
        let mut scored: Vec<(usize, &Document)> = self
            .documents
            .iter()
            .map(|d| (keywords(&d.content).intersection(&wanted).count(), d))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().map(|(_, d)| d.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_retriever_ranks_by_overlap() {
        let retriever = StaticRetriever::from_texts([
            "Dogs are loyal companions.",
            "Cats sleep most of the day; cats like boxes.",
            "Cats and dogs can live together.",
        ]);
        let docs = retriever.retrieve("why do cats like boxes").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.contains("boxes"));
        assert!(retriever.retrieve("quantum").await.unwrap().is_empty());
    }

    #[test]
    fn test_reference_format() {
        let text = format_references(&[Document::new("a"), Document::new("b")]);
        assert_eq!(text, "Reference 1: a\n\nReference 2: b");
        assert_eq!(format_references(&[]), "");
    }
}
