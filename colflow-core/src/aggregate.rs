//! Cross-partition aggregates.
//!
//! Each partition folds its column into an [`AggregateState`]; the
//! materializer merges the partial states in partition order once every live
//! partition has reached the barrier, and publishes the finished
//! [`AggregateValue`] to later stages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::column::{ColumnData, Value};
use crate::schema::ColumnType;

/// Reduction applied over a column across all partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Min,
    Max,
    Sum,
    /// Number of present (non-absent) values.
    Count,
    Mean,
    /// Sample standard deviation (n - 1).
    Std,
    /// Sorted distinct present values.
    Distinct,
}

/// Finished result of an aggregate, visible to downstream nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    /// `None` when there were no present values to reduce.
    Scalar(Option<Value>),
    Distinct(Vec<Value>),
}

impl AggregateValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => v.as_ref(),
            Self::Distinct(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    pub fn distinct(&self) -> Option<&[Value]> {
        match self {
            Self::Distinct(values) => Some(values),
            Self::Scalar(_) => None,
        }
    }
}

/// `f64` with a total order, for distinct sets.
#[derive(Debug, Clone, Copy)]
struct TotalF64(f64);

impl PartialEq for TotalF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum DistinctKey {
    Integer(i64),
    Float(TotalF64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl DistinctKey {
    fn into_value(self) -> Value {
        match self {
            Self::Integer(v) => Value::Integer(v),
            Self::Float(v) => Value::Float(v.0),
            Self::Text(v) => Value::Text(v),
            Self::Timestamp(v) => Value::Timestamp(v),
        }
    }
}

#[derive(Debug, Clone)]
enum Partial {
    Extreme(Option<Value>),
    IntSum(i64),
    FloatSum(f64),
    Count(u64),
    /// Running count, mean and sum of squared deviations.
    Moments { count: u64, mean: f64, m2: f64 },
    Distinct(BTreeSet<DistinctKey>),
}

/// Partial aggregate over some prefix of the partitions.
#[derive(Debug, Clone)]
pub struct AggregateState {
    op: AggregateOp,
    dtype: ColumnType,
    partial: Partial,
}

impl AggregateState {
    /// Fails when the reduction is undefined for the column type.
    pub fn new(op: AggregateOp, dtype: ColumnType) -> Result<Self, String> {
        let partial = match (op, dtype) {
            (AggregateOp::Min | AggregateOp::Max, _) => Partial::Extreme(None),
            (AggregateOp::Count, _) => Partial::Count(0),
            (AggregateOp::Distinct, _) => Partial::Distinct(BTreeSet::new()),
            (AggregateOp::Sum, ColumnType::Integer) => Partial::IntSum(0),
            (AggregateOp::Sum, ColumnType::Float) => Partial::FloatSum(0.0),
            (AggregateOp::Mean | AggregateOp::Std, t) if t.is_numeric() => Partial::Moments {
                count: 0,
                mean: 0.0,
                m2: 0.0,
            },
            (op, t) => return Err(format!("{op:?} is not defined for {t} columns")),
        };
        Ok(Self { op, dtype, partial })
    }

    pub fn op(&self) -> AggregateOp {
        self.op
    }

    /// Fold one partition's column into the state. Float NaN values are
    /// skipped by min, max, mean and std.
    pub fn update(&mut self, column: &ColumnData) -> Result<(), String> {
        if column.dtype() != self.dtype {
            return Err(format!(
                "aggregate expects a {} column, got {}",
                self.dtype,
                column.dtype()
            ));
        }
        let op = self.op;
        match &mut self.partial {
            Partial::Extreme(current) => {
                for row in 0..column.len() {
                    let Some(value) = column.get(row) else {
                        continue;
                    };
                    if matches!(value, Value::Float(f) if f.is_nan()) {
                        continue;
                    }
                    replace_extreme(current, value, op);
                }
            }
            Partial::IntSum(total) => {
                for v in column.as_integer().into_iter().flatten().flatten() {
                    *total = total
                        .checked_add(*v)
                        .ok_or_else(|| "integer sum overflowed".to_string())?;
                }
            }
            Partial::FloatSum(total) => {
                *total += column
                    .as_float()
                    .into_iter()
                    .flatten()
                    .flatten()
                    .sum::<f64>();
            }
            Partial::Count(count) => {
                *count += (column.len() - column.null_count()) as u64;
            }
            Partial::Moments { count, mean, m2 } => {
                let values = column.to_f64().unwrap_or_default();
                for x in values.into_iter().flatten().filter(|x| !x.is_nan()) {
                    *count += 1;
                    let delta = x - *mean;
                    *mean += delta / *count as f64;
                    *m2 += delta * (x - *mean);
                }
            }
            Partial::Distinct(set) => {
                insert_distinct(set, column);
            }
        }
        Ok(())
    }

    /// Merge a later partition's state into this one.
    pub fn merge(&mut self, other: AggregateState) -> Result<(), String> {
        if other.op != self.op || other.dtype != self.dtype {
            return Err("cannot merge aggregates of different kinds".to_string());
        }
        let op = self.op;
        match (&mut self.partial, other.partial) {
            (Partial::Extreme(current), Partial::Extreme(Some(value))) => {
                replace_extreme(current, value, op);
            }
            (Partial::Extreme(_), Partial::Extreme(None)) => {}
            (Partial::IntSum(a), Partial::IntSum(b)) => {
                *a = a
                    .checked_add(b)
                    .ok_or_else(|| "integer sum overflowed".to_string())?;
            }
            (Partial::FloatSum(a), Partial::FloatSum(b)) => *a += b,
            (Partial::Count(a), Partial::Count(b)) => *a += b,
            (
                Partial::Moments { count, mean, m2 },
                Partial::Moments {
                    count: n_b,
                    mean: mean_b,
                    m2: m2_b,
                },
            ) => {
                if n_b > 0 {
                    let n_a = *count as f64;
                    let total = (*count + n_b) as f64;
                    let delta = mean_b - *mean;
                    *mean += delta * n_b as f64 / total;
                    *m2 += m2_b + delta * delta * n_a * n_b as f64 / total;
                    *count += n_b;
                }
            }
            (Partial::Distinct(a), Partial::Distinct(b)) => a.extend(b),
            _ => return Err("aggregate partial states disagree".to_string()),
        }
        Ok(())
    }

    pub fn finish(self) -> AggregateValue {
        match self.partial {
            Partial::Extreme(value) => AggregateValue::Scalar(value),
            Partial::IntSum(total) => AggregateValue::Scalar(Some(Value::Integer(total))),
            Partial::FloatSum(total) => AggregateValue::Scalar(Some(Value::Float(total))),
            Partial::Count(count) => AggregateValue::Scalar(Some(Value::Integer(
                i64::try_from(count).unwrap_or(i64::MAX),
            ))),
            Partial::Moments { count, mean, m2 } => {
                let value = match self.op {
                    AggregateOp::Mean if count > 0 => Some(mean),
                    AggregateOp::Std if count > 1 => Some((m2 / (count - 1) as f64).sqrt()),
                    _ => None,
                };
                AggregateValue::Scalar(value.map(Value::Float))
            }
            Partial::Distinct(set) => {
                AggregateValue::Distinct(set.into_iter().map(DistinctKey::into_value).collect())
            }
        }
    }
}

fn replace_extreme(current: &mut Option<Value>, candidate: Value, op: AggregateOp) {
    let better = match current {
        None => true,
        Some(existing) => {
            let ord = candidate.compare(existing);
            match op {
                AggregateOp::Min => ord == Some(Ordering::Less),
                _ => ord == Some(Ordering::Greater),
            }
        }
    };
    if better {
        *current = Some(candidate);
    }
}

fn insert_distinct(set: &mut BTreeSet<DistinctKey>, column: &ColumnData) {
    match column {
        ColumnData::Integer(v) => set.extend(v.iter().flatten().map(|x| DistinctKey::Integer(*x))),
        ColumnData::Float(v) => set.extend(
            v.iter()
                .flatten()
                .map(|x| DistinctKey::Float(TotalF64(*x))),
        ),
        ColumnData::Text(v) => set.extend(v.iter().flatten().map(|x| DistinctKey::Text(x.clone()))),
        ColumnData::Timestamp(v) => {
            set.extend(v.iter().flatten().map(|x| DistinctKey::Timestamp(*x)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(op: AggregateOp, parts: &[ColumnData]) -> AggregateValue {
        let dtype = parts[0].dtype();
        let mut total = AggregateState::new(op, dtype).unwrap();
        for part in parts {
            let mut partial = AggregateState::new(op, dtype).unwrap();
            partial.update(part).unwrap();
            total.merge(partial).unwrap();
        }
        total.finish()
    }

    #[test]
    fn test_min_max_skip_missing() {
        let parts = [
            ColumnData::from(vec![Some(5_i64), None]),
            ColumnData::from(vec![Some(-2_i64), Some(9)]),
        ];
        assert_eq!(
            fold(AggregateOp::Min, &parts),
            AggregateValue::Scalar(Some(Value::Integer(-2)))
        );
        assert_eq!(
            fold(AggregateOp::Max, &parts),
            AggregateValue::Scalar(Some(Value::Integer(9)))
        );
    }

    #[test]
    fn test_all_missing_is_absent() {
        let parts = [ColumnData::from(vec![None::<f64>, None])];
        assert_eq!(fold(AggregateOp::Min, &parts), AggregateValue::Scalar(None));
        assert_eq!(fold(AggregateOp::Mean, &parts), AggregateValue::Scalar(None));
        assert_eq!(
            fold(AggregateOp::Count, &parts),
            AggregateValue::Scalar(Some(Value::Integer(0)))
        );
    }

    #[test]
    fn test_mean_and_std_merge_across_partitions() {
        let parts = [
            ColumnData::from(vec![Some(2.0), Some(4.0)]),
            ColumnData::from(vec![Some(4.0), Some(4.0), Some(5.0)]),
            ColumnData::from(vec![Some(5.0), Some(7.0), Some(9.0)]),
        ];
        let mean = fold(AggregateOp::Mean, &parts).as_f64().unwrap();
        assert!((mean - 5.0).abs() < 1e-12);
        // Sample std of [2,4,4,4,5,5,7,9] is sqrt(32/7).
        let std = fold(AggregateOp::Std, &parts).as_f64().unwrap();
        assert!((std - (32.0_f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sum_is_typed() {
        let ints = [ColumnData::from(vec![Some(1_i64), Some(2)])];
        assert_eq!(
            fold(AggregateOp::Sum, &ints),
            AggregateValue::Scalar(Some(Value::Integer(3)))
        );
        assert!(AggregateState::new(AggregateOp::Sum, ColumnType::Text).is_err());
        assert!(AggregateState::new(AggregateOp::Mean, ColumnType::Timestamp).is_err());
    }

    #[test]
    fn test_integer_sum_overflow_is_error() {
        let mut state = AggregateState::new(AggregateOp::Sum, ColumnType::Integer).unwrap();
        let err = state.update(&ColumnData::from(vec![Some(i64::MAX), Some(1)]));
        assert!(err.is_err());
    }

    #[test]
    fn test_distinct_is_sorted_union() {
        let parts = [
            ColumnData::from(vec![Some("b".to_string()), None, Some("a".into())]),
            ColumnData::from(vec![Some("c".to_string()), Some("a".into())]),
        ];
        let distinct = fold(AggregateOp::Distinct, &parts);
        assert_eq!(
            distinct.distinct().unwrap(),
            &[
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Text("c".into())
            ]
        );
    }

    #[test]
    fn test_update_rejects_wrong_dtype() {
        let mut state = AggregateState::new(AggregateOp::Min, ColumnType::Integer).unwrap();
        assert!(state.update(&ColumnData::from(vec![Some(1.0)])).is_err());
    }
}
