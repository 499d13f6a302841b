//! Row predicates and the read-only column query used by front ends.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::column::{Column, ColumnData, Value};
use crate::error::{ColflowError, Result};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// Boolean condition over the cells of one row.
///
/// An absent cell never satisfies `Compare`; test for it with `IsMissing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowPredicate {
    IsMissing {
        column: String,
    },
    IsPresent {
        column: String,
    },
    Compare {
        column: String,
        cmp: CompareOp,
        value: Value,
    },
    And {
        all: Vec<RowPredicate>,
    },
    Or {
        any: Vec<RowPredicate>,
    },
    Not {
        predicate: Box<RowPredicate>,
    },
}

impl RowPredicate {
    pub fn compare(column: impl Into<String>, cmp: CompareOp, value: Value) -> Self {
        Self::Compare {
            column: column.into(),
            cmp,
            value,
        }
    }

    pub fn is_present(column: impl Into<String>) -> Self {
        Self::IsPresent {
            column: column.into(),
        }
    }

    /// Referenced columns, first occurrence order.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Self::IsMissing { column }
            | Self::IsPresent { column }
            | Self::Compare { column, .. } => {
                if !out.contains(column) {
                    out.push(column.clone());
                }
            }
            Self::And { all: preds } | Self::Or { any: preds } => {
                for p in preds {
                    p.collect_columns(out);
                }
            }
            Self::Not { predicate } => predicate.collect_columns(out),
        }
    }

    /// One flag per row. `lookup` resolves a column name to its data.
    pub fn mask<'a, F>(&self, lookup: &F, rows: usize) -> std::result::Result<Vec<bool>, String>
    where
        F: Fn(&str) -> Option<&'a ColumnData>,
    {
        let column = |name: &str| lookup(name).ok_or_else(|| format!("no column '{name}'"));
        match self {
            Self::IsMissing { column: name } => {
                let data = column(name)?;
                Ok((0..rows).map(|r| data.is_missing(r)).collect())
            }
            Self::IsPresent { column: name } => {
                let data = column(name)?;
                Ok((0..rows).map(|r| !data.is_missing(r)).collect())
            }
            Self::Compare {
                column: name,
                cmp,
                value,
            } => {
                let data = column(name)?;
                (0..rows)
                    .map(|r| match data.get(r) {
                        None => Ok(false),
                        Some(cell) => match cell.compare(value) {
                            Some(ord) => Ok(cmp.holds(ord)),
                            // NaN against a number.
                            None if cell.dtype().is_numeric() && value.dtype().is_numeric() => {
                                Ok(false)
                            }
                            None => Err(format!(
                                "cannot compare {} column '{name}' with {} value",
                                cell.dtype(),
                                value.dtype()
                            )),
                        },
                    })
                    .collect()
            }
            Self::And { all } => {
                let mut acc = vec![true; rows];
                for p in all {
                    for (a, b) in acc.iter_mut().zip(p.mask(lookup, rows)?) {
                        *a &= b;
                    }
                }
                Ok(acc)
            }
            Self::Or { any } => {
                let mut acc = vec![false; rows];
                for p in any {
                    for (a, b) in acc.iter_mut().zip(p.mask(lookup, rows)?) {
                        *a |= b;
                    }
                }
                Ok(acc)
            }
            Self::Not { predicate } => Ok(predicate
                .mask(lookup, rows)?
                .into_iter()
                .map(|b| !b)
                .collect()),
        }
    }

    /// Evaluate against a whole table.
    pub fn mask_table(&self, table: &Table) -> Result<Vec<bool>> {
        self.mask(&|name: &str| table.column(name).map(|c| &c.data), table.num_rows())
            .map_err(|e| ColflowError::transform("predicate", e))
    }
}

/// Read-only request for one column of a materialized table, optionally
/// restricted to the rows matching `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnQuery {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowPredicate>,
}

impl ColumnQuery {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: RowPredicate) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn run(&self, table: &Table) -> Result<Column> {
        let column = table
            .column(&self.column)
            .ok_or_else(|| ColflowError::UnresolvedColumn {
                node: "query".to_string(),
                name: self.column.clone(),
            })?;
        match &self.filter {
            None => Ok(column.clone()),
            Some(filter) => {
                let mask = filter.mask_table(table)?;
                Ok(Column::new(column.name.clone(), column.data.filter(&mask)))
            }
        }
    }
}
