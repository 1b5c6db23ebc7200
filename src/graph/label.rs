//! 图谱标签值对象
//!
//! 实体类型、关系类型以及过滤用的属性键都会被拼进 SQL 文本，
//! 因此只能通过构造函数获得：校验 `^[A-Za-z][A-Za-z0-9_]*$` 通过后才存在，未校验的字符串无法到达查询构造。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, Result};

static LABEL_RE: OnceLock<Regex> = OnceLock::new();

fn label_re() -> &'static Regex {
    LABEL_RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static label pattern"))
}

/// 实体类型 / 关系类型（校验后统一大写）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// 未映射类型的实体使用的默认类型
    pub const DEFAULT_ENTITY: &'static str = "ENTITY";

    pub fn new(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !label_re().is_match(raw) {
            return Err(CoreError::InvalidLabel(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_uppercase()))
    }

    pub fn default_entity() -> Self {
        Self(Self::DEFAULT_ENTITY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Label::new(&value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

/// 关系属性过滤键；保留大小写，拼入 `json_extract(properties, '$.key')`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub fn new(raw: &str) -> Result<Self> {
        if !label_re().is_match(raw) {
            return Err(CoreError::InvalidLabel(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// JSON 路径字面量，如 `'$.since'`
    pub(crate) fn json_path(&self) -> String {
        format!("'$.{}'", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_validation_and_normalization() {
        assert_eq!(Label::new("works_at").unwrap().as_str(), "WORKS_AT");
        assert_eq!(Label::new(" Person ").unwrap().as_str(), "PERSON");
        for bad in ["", "1abc", "has space", "drop;table", "a-b", "_x", "名字"] {
            assert!(
                matches!(Label::new(bad), Err(CoreError::InvalidLabel(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_label_deserialize_validates() {
        let ok: Label = serde_json::from_str("\"city\"").unwrap();
        assert_eq!(ok.as_str(), "CITY");
        assert!(serde_json::from_str::<Label>("\"x') OR 1=1 --\"").is_err());
    }

    #[test]
    fn test_property_key() {
        assert_eq!(PropertyKey::new("since").unwrap().json_path(), "'$.since'");
        assert!(PropertyKey::new("a'b").is_err());
    }
}
