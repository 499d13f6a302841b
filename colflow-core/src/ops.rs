//! Built-in transforms.
//!
//! Each constructor returns the node (or nodes) to declare on a
//! [`PipelineBuilder`](crate::graph::PipelineBuilder). Transforms that need
//! global statistics emit their aggregate nodes first, named
//! `{output}__{stat}`, followed by the derive node that reads them.

use chrono::{DateTime, Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::aggregate::{AggregateOp, AggregateValue};
use crate::column::{ColumnData, Value};
use crate::graph::{Node, NodeInputs};
use crate::query::RowPredicate;
use crate::reader::parse_timestamp;
use crate::schema::ColumnType;

type FnResult<T> = std::result::Result<T, String>;

/// Name of the aggregate a statistic-driven transform declares for `output`.
pub fn stat_name(output: &str, stat: &str) -> String {
    format!("{output}__{stat}")
}

/// Strict conversion to `to`. Values that do not convert exactly are an
/// error; absent stays absent.
pub fn cast(input: &str, output: &str, to: ColumnType) -> Node {
    Node::derive([output], [input], move |inp| {
        Ok(vec![cast_column(inp.column(0)?, to)?])
    })
}

fn cast_column(data: &ColumnData, to: ColumnType) -> FnResult<ColumnData> {
    if data.dtype() == to {
        return Ok(data.clone());
    }
    let mut out = ColumnData::with_capacity(to, data.len());
    for row in 0..data.len() {
        let cell = data.get(row).map(|v| cast_value(v, to)).transpose()?;
        out.push(cell).map_err(|e| e.to_string())?;
    }
    Ok(out)
}

fn cast_value(value: Value, to: ColumnType) -> FnResult<Value> {
    let unsupported = |v: &Value| format!("cannot cast {} value {v} to {to}", v.dtype());
    Ok(match (value, to) {
        (v, ColumnType::Text) => Value::Text(v.to_string()),
        (Value::Integer(i), ColumnType::Float) => Value::Float(i as f64),
        (Value::Float(f), ColumnType::Integer) => {
            if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                Value::Integer(f as i64)
            } else {
                return Err(format!("float {f} is not an exact integer"));
            }
        }
        (Value::Text(s), ColumnType::Integer) => Value::Integer(
            s.parse()
                .map_err(|_| format!("cannot cast text {s:?} to integer"))?,
        ),
        (Value::Text(s), ColumnType::Float) => Value::Float(
            s.parse()
                .map_err(|_| format!("cannot cast text {s:?} to float"))?,
        ),
        (Value::Text(s), ColumnType::Timestamp) => Value::Timestamp(
            parse_timestamp(&s, None).ok_or_else(|| format!("cannot cast text {s:?} to timestamp"))?,
        ),
        (Value::Timestamp(t), ColumnType::Integer) => Value::Integer(t.and_utc().timestamp()),
        (Value::Integer(secs), ColumnType::Timestamp) => Value::Timestamp(
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| format!("epoch seconds {secs} out of range"))?
                .naive_utc(),
        ),
        (v, _) => return Err(unsupported(&v)),
    })
}

/// Replace absent cells of `input` with `value`. An integer value may fill a
/// float column; any other type difference is an error.
pub fn fill_missing(input: &str, output: &str, value: Value) -> Node {
    Node::derive([output], [input], move |inp| {
        let data = inp.column(0)?;
        let fill = match (&value, data.dtype()) {
            (Value::Integer(i), ColumnType::Float) => Value::Float(*i as f64),
            (v, dtype) if v.dtype() == dtype => v.clone(),
            (v, dtype) => {
                return Err(format!("cannot fill {dtype} column with {} value", v.dtype()));
            }
        };
        let mut out = ColumnData::with_capacity(data.dtype(), data.len());
        for row in 0..data.len() {
            out.push(Some(data.get(row).unwrap_or_else(|| fill.clone())))
                .map_err(|e| e.to_string())?;
        }
        Ok(vec![out])
    })
    .with_label(format!("fill_missing({input})"))
}

/// Keep only rows where every listed column is present.
pub fn drop_missing<S: AsRef<str>>(columns: &[S]) -> Node {
    let columns: Vec<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();
    let label = format!("drop_missing({})", columns.join(","));
    Node::filter(label, columns, |inp| {
        Ok((0..inp.rows())
            .map(|row| inp.columns().iter().all(|c| !c.is_missing(row)))
            .collect())
    })
}

/// Keep only rows matching `predicate`.
pub fn filter_where(label: &str, predicate: RowPredicate) -> Node {
    let columns = predicate.columns();
    let index: HashMap<String, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect();
    Node::filter(label, columns, move |inp| {
        let lookup = |name: &str| index.get(name).and_then(|&i| inp.column(i).ok());
        predicate.mask(&lookup, inp.rows())
    })
}

/// Copy `input` to `{input}{suffix}`.
pub fn alias(input: &str, suffix: &str) -> Node {
    Node::derive([format!("{input}{suffix}")], [input], |inp| {
        Ok(vec![inp.column(0)?.clone()])
    })
}

fn scalar_f64(value: &AggregateValue) -> Option<f64> {
    value.as_f64()
}

fn numeric(data: &ColumnData) -> FnResult<Vec<Option<f64>>> {
    data.to_f64()
        .ok_or_else(|| format!("expected a numeric column, got {}", data.dtype()))
}

/// Rescale to `[0, 1]` using the global min and max. A constant column maps
/// to `0.0`.
pub fn min_max_scale(input: &str, output: &str) -> Vec<Node> {
    let min = stat_name(output, "min");
    let max = stat_name(output, "max");
    vec![
        Node::aggregate(&min, input, AggregateOp::Min),
        Node::aggregate(&max, input, AggregateOp::Max),
        Node::derive([output], [input], |inp| {
            let values = numeric(inp.column(0)?)?;
            let bounds = scalar_f64(inp.param(0)?).zip(scalar_f64(inp.param(1)?));
            let scaled = values
                .into_iter()
                .map(|v| {
                    let (lo, hi) = bounds?;
                    let range = hi - lo;
                    v.map(|x| if range == 0.0 { 0.0 } else { (x - lo) / range })
                })
                .collect::<Vec<_>>();
            Ok(vec![ColumnData::Float(scaled)])
        })
        .with_params([min, max]),
    ]
}

/// Z-score using the global mean and sample standard deviation. Zero or
/// undefined deviation maps present values to `0.0`.
pub fn standardize(input: &str, output: &str) -> Vec<Node> {
    let mean = stat_name(output, "mean");
    let std = stat_name(output, "std");
    vec![
        Node::aggregate(&mean, input, AggregateOp::Mean),
        Node::aggregate(&std, input, AggregateOp::Std),
        Node::derive([output], [input], |inp| {
            let values = numeric(inp.column(0)?)?;
            let mean = scalar_f64(inp.param(0)?);
            let std = scalar_f64(inp.param(1)?).unwrap_or(0.0);
            let scaled = values
                .into_iter()
                .map(|v| {
                    let mu = mean?;
                    v.map(|x| if std == 0.0 { 0.0 } else { (x - mu) / std })
                })
                .collect();
            Ok(vec![ColumnData::Float(scaled)])
        })
        .with_params([mean, std]),
    ]
}

fn category_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        _ => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Encode values as 1-based ids into the sorted set of distinct values seen
/// across all partitions. Absent stays absent.
pub fn categorify(input: &str, output: &str) -> Vec<Node> {
    let categories = stat_name(output, "categories");
    vec![
        Node::aggregate(&categories, input, AggregateOp::Distinct),
        Node::derive([output], [input], |inp| {
            let data = inp.column(0)?;
            let distinct = inp
                .param(0)?
                .distinct()
                .ok_or_else(|| "categories aggregate is not a distinct set".to_string())?;
            let ids = (0..data.len())
                .map(|row| match data.get(row) {
                    None => Ok(None),
                    Some(v) => distinct
                        .binary_search_by(|candidate| category_order(candidate, &v))
                        .map(|i| Some(i as i64 + 1))
                        .map_err(|_| format!("value {v} missing from categories")),
                })
                .collect::<FnResult<Vec<_>>>()?;
            Ok(vec![ColumnData::Integer(ids)])
        })
        .with_params([categories]),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatetimePart {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    /// Monday = 0.
    Weekday,
    /// 1-based.
    DayOfYear,
}

/// Extract a calendar field from a timestamp column as an integer column.
pub fn datetime_part(input: &str, output: &str, part: DatetimePart) -> Node {
    Node::derive([output], [input], move |inp| {
        let data = inp.column(0)?;
        let stamps = data
            .as_timestamp()
            .ok_or_else(|| format!("expected a timestamp column, got {}", data.dtype()))?;
        let parts = stamps
            .iter()
            .map(|t| {
                t.map(|t| match part {
                    DatetimePart::Year => i64::from(t.year()),
                    DatetimePart::Month => i64::from(t.month()),
                    DatetimePart::Day => i64::from(t.day()),
                    DatetimePart::Hour => i64::from(t.hour()),
                    DatetimePart::Minute => i64::from(t.minute()),
                    DatetimePart::Weekday => i64::from(t.weekday().num_days_from_monday()),
                    DatetimePart::DayOfYear => i64::from(t.ordinal()),
                })
            })
            .collect();
        Ok(vec![ColumnData::Integer(parts)])
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise `left op right` as float. Absent if either side is absent.
pub fn arithmetic(left: &str, right: &str, output: &str, op: ArithOp) -> Node {
    Node::derive([output], [left, right], move |inp| {
        let a = numeric(inp.column(0)?)?;
        let b = numeric(inp.column(1)?)?;
        let out = a
            .into_iter()
            .zip(b)
            .map(|(x, y)| {
                let (x, y) = x.zip(y)?;
                Some(match op {
                    ArithOp::Add => x + y,
                    ArithOp::Sub => x - y,
                    ArithOp::Mul => x * y,
                    ArithOp::Div => x / y,
                })
            })
            .collect();
        Ok(vec![ColumnData::Float(out)])
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    /// Natural log.
    Log,
    Sqrt,
    Abs,
    Square,
}

pub fn unary(input: &str, output: &str, op: UnaryOp) -> Node {
    Node::derive([output], [input], move |inp: &NodeInputs<'_>| {
        let values = numeric(inp.column(0)?)?;
        let out = values
            .into_iter()
            .map(|v| {
                v.map(|x| match op {
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Square => x * x,
                })
            })
            .collect();
        Ok(vec![ColumnData::Float(out)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use chrono::NaiveDate;

    fn run(node: &Node, columns: &[&ColumnData], params: &[&AggregateValue]) -> FnResult<Vec<ColumnData>> {
        let rows = columns.first().map_or(0, |c| c.len());
        let inputs = NodeInputs::new(columns.to_vec(), params.to_vec(), rows);
        match node.kind() {
            NodeKind::Derive(f) => f(&inputs),
            other => panic!("not a derive node: {other:?}"),
        }
    }

    fn run_filter(node: &Node, columns: &[&ColumnData]) -> Vec<bool> {
        let rows = columns.first().map_or(0, |c| c.len());
        let inputs = NodeInputs::new(columns.to_vec(), Vec::new(), rows);
        match node.kind() {
            NodeKind::Filter(f) => f(&inputs).unwrap(),
            other => panic!("not a filter node: {other:?}"),
        }
    }

    #[test]
    fn test_cast_is_strict() {
        let floats = ColumnData::from(vec![Some(2.0), None]);
        let out = run(&cast("x", "y", ColumnType::Integer), &[&floats], &[]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(2_i64), None]));

        let fractional = ColumnData::from(vec![Some(2.5)]);
        assert!(run(&cast("x", "y", ColumnType::Integer), &[&fractional], &[]).is_err());

        let text = ColumnData::from(vec![Some("12".to_string()), Some("x".into())]);
        assert!(run(&cast("x", "y", ColumnType::Integer), &[&text], &[]).is_err());
    }

    #[test]
    fn test_cast_timestamp_epoch() {
        let t = NaiveDate::from_ymd_opt(1970, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let stamps = ColumnData::from(vec![Some(t)]);
        let out = run(&cast("t", "s", ColumnType::Integer), &[&stamps], &[]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(86_400_i64)]));
    }

    #[test]
    fn test_fill_missing_type_checked() {
        let col = ColumnData::from(vec![Some(1.5), None]);
        let out = run(&fill_missing("x", "y", Value::Integer(0)), &[&col], &[]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(1.5), Some(0.0)]));
        assert!(run(&fill_missing("x", "y", Value::Text("0".into())), &[&col], &[]).is_err());
    }

    #[test]
    fn test_drop_missing_mask() {
        let a = ColumnData::from(vec![Some(1_i64), None, Some(3)]);
        let b = ColumnData::from(vec![Some(1_i64), Some(2), None]);
        assert_eq!(run_filter(&drop_missing(&["a", "b"]), &[&a, &b]), vec![true, false, false]);
    }

    #[test]
    fn test_alias_output_name() {
        assert_eq!(alias("VALUE", "_raw").outputs(), ["VALUE_raw"]);
    }

    #[test]
    fn test_min_max_uses_params() {
        let nodes = min_max_scale("v", "v_scaled");
        assert_eq!(nodes[0].outputs(), ["v_scaled__min"]);
        assert_eq!(nodes[2].params(), ["v_scaled__min", "v_scaled__max"]);

        let col = ColumnData::from(vec![Some(0_i64), Some(5), None]);
        let lo = AggregateValue::Scalar(Some(Value::Integer(0)));
        let hi = AggregateValue::Scalar(Some(Value::Integer(10)));
        let out = run(&nodes[2], &[&col], &[&lo, &hi]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(0.0), Some(0.5), None]));

        let out = run(&nodes[2], &[&col], &[&lo, &lo]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(0.0), Some(0.0), None]));
    }

    #[test]
    fn test_standardize_zero_std() {
        let nodes = standardize("v", "z");
        let col = ColumnData::from(vec![Some(3.0), Some(5.0)]);
        let mean = AggregateValue::Scalar(Some(Value::Float(4.0)));
        let std = AggregateValue::Scalar(Some(Value::Float(2.0)));
        let out = run(&nodes[2], &[&col], &[&mean, &std]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(-0.5), Some(0.5)]));

        let zero = AggregateValue::Scalar(Some(Value::Float(0.0)));
        let out = run(&nodes[2], &[&col], &[&mean, &zero]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(0.0), Some(0.0)]));
    }

    #[test]
    fn test_categorify_ids() {
        let nodes = categorify("s", "s_id");
        let col = ColumnData::from(vec![Some("b".to_string()), None, Some("a".into())]);
        let cats = AggregateValue::Distinct(vec![Value::Text("a".into()), Value::Text("b".into())]);
        let out = run(&nodes[1], &[&col], &[&cats]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(2_i64), None, Some(1)]));
    }

    #[test]
    fn test_datetime_parts() {
        let t = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(13, 45, 0)
            .unwrap();
        let col = ColumnData::from(vec![Some(t), None]);
        let get = |part| run(&datetime_part("t", "p", part), &[&col], &[]).unwrap().remove(0);
        assert_eq!(get(DatetimePart::Year), ColumnData::from(vec![Some(2024_i64), None]));
        assert_eq!(get(DatetimePart::Weekday), ColumnData::from(vec![Some(3_i64), None]));
        assert_eq!(get(DatetimePart::DayOfYear), ColumnData::from(vec![Some(60_i64), None]));
        assert_eq!(get(DatetimePart::Hour), ColumnData::from(vec![Some(13_i64), None]));
    }

    #[test]
    fn test_arithmetic_absent_propagates() {
        let a = ColumnData::from(vec![Some(6_i64), None, Some(1)]);
        let b = ColumnData::from(vec![Some(3.0), Some(1.0), Some(0.0)]);
        let out = run(&arithmetic("a", "b", "c", ArithOp::Div), &[&a, &b], &[]).unwrap();
        assert_eq!(out[0], ColumnData::from(vec![Some(2.0), None, Some(f64::INFINITY)]));
    }

    #[test]
    fn test_unary_rejects_text() {
        let text = ColumnData::from(vec![Some("x".to_string())]);
        assert!(run(&unary("t", "u", UnaryOp::Sqrt), &[&text], &[]).is_err());
    }
}
