//! Schema declaration: ordered column names, semantic types and sentinels.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ColflowError, Result};

/// Timestamp layout used when a column declares no explicit format.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Semantic column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Declaration of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: ColumnType,
    /// Raw text that means "no data" in this column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<String>,
    /// chrono format string for timestamp columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
            sentinel: None,
            format: None,
        }
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = Some(sentinel.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn is_sentinel(&self, raw: &str) -> bool {
        self.sentinel.as_deref() == Some(raw)
    }

    pub fn timestamp_format(&self) -> &str {
        self.format.as_deref().unwrap_or(DEFAULT_TIMESTAMP_FORMAT)
    }
}

/// Ordered mapping from column name to type and sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColumnSpec>", into = "Vec<ColumnSpec>")]
pub struct Schema {
    columns: Vec<ColumnSpec>,
}

impl Schema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(ColflowError::config("schema column names must not be empty"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(ColflowError::collision(column.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl TryFrom<Vec<ColumnSpec>> for Schema {
    type Error = ColflowError;

    fn try_from(columns: Vec<ColumnSpec>) -> Result<Self> {
        Self::new(columns)
    }
}

impl From<Schema> for Vec<ColumnSpec> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station_schema() -> Schema {
        Schema::new(vec![
            ColumnSpec::new("STATION", ColumnType::Text),
            ColumnSpec::new("VALUE", ColumnType::Integer).with_sentinel("-9999"),
        ])
        .unwrap()
    }

    #[test]
    fn test_schema_order_is_declaration_order() {
        let schema = station_schema();
        let names: Vec<_> = schema.names().collect();
        assert_eq!(names, vec!["STATION", "VALUE"]);
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = Schema::new(vec![
            ColumnSpec::new("A", ColumnType::Text),
            ColumnSpec::new("A", ColumnType::Float),
        ])
        .unwrap_err();
        assert!(matches!(err, ColflowError::Collision { name } if name == "A"));
    }

    #[test]
    fn test_sentinel_is_exact_text() {
        let schema = station_schema();
        let value = schema.get("VALUE").unwrap();
        assert!(value.is_sentinel("-9999"));
        assert!(!value.is_sentinel("-9999.0"));
        assert!(!schema.get("STATION").unwrap().is_sentinel("-9999"));
    }

    #[test]
    fn test_schema_json_shape() {
        let json = r#"[
            {"name": "STATION", "type": "text"},
            {"name": "VALUE", "type": "integer", "sentinel": "-9999"}
        ]"#;
        let schema: Schema = serde_json::from_str(json).unwrap();
        assert_eq!(schema, station_schema());
    }

    #[test]
    fn test_schema_json_rejects_duplicates() {
        let json = r#"[{"name": "A", "type": "text"}, {"name": "A", "type": "text"}]"#;
        assert!(serde_json::from_str::<Schema>(json).is_err());
    }
}
