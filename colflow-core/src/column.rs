//! Typed, nullable column storage.
//!
//! Every column is a homogeneous `Vec<Option<T>>`; `None` is the absent
//! marker and is never folded into `0` or `""`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{ColflowError, Result};
use crate::schema::{ColumnType, DEFAULT_TIMESTAMP_FORMAT};

/// A single present cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn dtype(&self) -> ColumnType {
        match self {
            Self::Integer(_) => ColumnType::Integer,
            Self::Float(_) => ColumnType::Float,
            Self::Text(_) => ColumnType::Text,
            Self::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Order two values. Integers and floats compare numerically; any other
    /// cross-type comparison is `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Timestamp(v) => write!(f, "{}", v.format(DEFAULT_TIMESTAMP_FORMAT)),
        }
    }
}

/// Column payload, one variant per semantic type.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

macro_rules! each_variant {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ColumnData::Integer($values) => $body,
            ColumnData::Float($values) => $body,
            ColumnData::Text($values) => $body,
            ColumnData::Timestamp($values) => $body,
        }
    };
}

macro_rules! map_variant {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            ColumnData::Integer($values) => ColumnData::Integer($body),
            ColumnData::Float($values) => ColumnData::Float($body),
            ColumnData::Text($values) => ColumnData::Text($body),
            ColumnData::Timestamp($values) => ColumnData::Timestamp($body),
        }
    };
}

impl ColumnData {
    pub fn empty(dtype: ColumnType) -> Self {
        Self::with_capacity(dtype, 0)
    }

    pub fn with_capacity(dtype: ColumnType, capacity: usize) -> Self {
        match dtype {
            ColumnType::Integer => Self::Integer(Vec::with_capacity(capacity)),
            ColumnType::Float => Self::Float(Vec::with_capacity(capacity)),
            ColumnType::Text => Self::Text(Vec::with_capacity(capacity)),
            ColumnType::Timestamp => Self::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    pub fn dtype(&self) -> ColumnType {
        match self {
            Self::Integer(_) => ColumnType::Integer,
            Self::Float(_) => ColumnType::Float,
            Self::Text(_) => ColumnType::Text,
            Self::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        each_variant!(self, v => v.iter().filter(|x| x.is_none()).count())
    }

    pub fn is_missing(&self, row: usize) -> bool {
        each_variant!(self, v => v.get(row).is_none_or(Option::is_none))
    }

    /// Value at `row`, or `None` when absent or out of range.
    pub fn get(&self, row: usize) -> Option<Value> {
        match self {
            Self::Integer(v) => v.get(row).copied().flatten().map(Value::Integer),
            Self::Float(v) => v.get(row).copied().flatten().map(Value::Float),
            Self::Text(v) => v.get(row).cloned().flatten().map(Value::Text),
            Self::Timestamp(v) => v.get(row).copied().flatten().map(Value::Timestamp),
        }
    }

    /// Append one cell; the value must match the column type exactly.
    pub fn push(&mut self, value: Option<Value>) -> Result<()> {
        match (self, value) {
            (Self::Integer(v), None) => v.push(None),
            (Self::Float(v), None) => v.push(None),
            (Self::Text(v), None) => v.push(None),
            (Self::Timestamp(v), None) => v.push(None),
            (Self::Integer(v), Some(Value::Integer(x))) => v.push(Some(x)),
            (Self::Float(v), Some(Value::Float(x))) => v.push(Some(x)),
            (Self::Text(v), Some(Value::Text(x))) => v.push(Some(x)),
            (Self::Timestamp(v), Some(Value::Timestamp(x))) => v.push(Some(x)),
            (data, Some(other)) => {
                return Err(ColflowError::shape(format!(
                    "cannot push {} value into {} column",
                    other.dtype(),
                    data.dtype()
                )));
            }
        }
        Ok(())
    }

    /// Append all rows of `other`, which must have the same type.
    pub fn append(&mut self, other: &ColumnData) -> Result<()> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.extend_from_slice(b),
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (Self::Text(a), Self::Text(b)) => a.extend_from_slice(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(ColflowError::shape(format!(
                    "cannot append {} column to {} column",
                    b.dtype(),
                    a.dtype()
                )));
            }
        }
        Ok(())
    }

    /// Rows `[start, end)`, clamped to the column length.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let len = self.len();
        let end = end.min(len);
        let start = start.min(end);
        map_variant!(self, v => v[start..end].to_vec())
    }

    /// Keep rows whose mask entry is `true`. Mask length must equal `len()`.
    pub fn filter(&self, mask: &[bool]) -> Self {
        map_variant!(self, v => v
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(x, _)| x.clone())
            .collect())
    }

    pub fn as_integer(&self) -> Option<&[Option<i64>]> {
        match self {
            Self::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&[Option<f64>]> {
        match self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&[Option<String>]> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<&[Option<NaiveDateTime>]> {
        match self {
            Self::Timestamp(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view as `f64`; `None` for text and timestamp columns.
    pub fn to_f64(&self) -> Option<Vec<Option<f64>>> {
        match self {
            Self::Integer(v) => Some(v.iter().map(|x| x.map(|i| i as f64)).collect()),
            Self::Float(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl From<Vec<Option<i64>>> for ColumnData {
    fn from(values: Vec<Option<i64>>) -> Self {
        Self::Integer(values)
    }
}

impl From<Vec<Option<f64>>> for ColumnData {
    fn from(values: Vec<Option<f64>>) -> Self {
        Self::Float(values)
    }
}

impl From<Vec<Option<String>>> for ColumnData {
    fn from(values: Vec<Option<String>>) -> Self {
        Self::Text(values)
    }
}

impl From<Vec<Option<NaiveDateTime>>> for ColumnData {
    fn from(values: Vec<Option<NaiveDateTime>>) -> Self {
        Self::Timestamp(values)
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: impl Into<ColumnData>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dtype(&self) -> ColumnType {
        self.data.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_is_distinct_from_zero_and_empty() {
        let ints = ColumnData::from(vec![Some(0), None]);
        assert_eq!(ints.get(0), Some(Value::Integer(0)));
        assert_eq!(ints.get(1), None);
        assert!(ints.is_missing(1));
        assert!(!ints.is_missing(0));

        let text = ColumnData::from(vec![Some(String::new()), None]);
        assert_eq!(text.get(0), Some(Value::Text(String::new())));
        assert_eq!(text.null_count(), 1);
    }

    #[test]
    fn test_push_is_type_checked() {
        let mut col = ColumnData::empty(ColumnType::Integer);
        col.push(Some(Value::Integer(4))).unwrap();
        col.push(None).unwrap();
        assert!(col.push(Some(Value::Float(1.5))).is_err());
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn test_append_rejects_type_change() {
        let mut a = ColumnData::from(vec![Some(1_i64)]);
        let b = ColumnData::from(vec![Some(1.0_f64)]);
        assert!(matches!(a.append(&b), Err(ColflowError::Shape { .. })));
        a.append(&ColumnData::from(vec![Some(2_i64), None])).unwrap();
        assert_eq!(a, ColumnData::from(vec![Some(1), Some(2), None]));
    }

    #[test]
    fn test_slice_and_filter() {
        let col = ColumnData::from(vec![Some(1_i64), Some(2), None, Some(4)]);
        assert_eq!(col.slice(1, 3), ColumnData::from(vec![Some(2), None]));
        assert_eq!(col.slice(3, 99), ColumnData::from(vec![Some(4)]));
        assert_eq!(
            col.filter(&[true, false, true, false]),
            ColumnData::from(vec![Some(1), None])
        );
    }

    #[test]
    fn test_value_compare_numeric_cross_type() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("a".into()).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_value_serde_is_tagged() {
        let json = serde_json::to_string(&Value::Integer(0)).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":0}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Integer(0));
    }
}
