//! In-memory table: ordered, equal-length, uniquely named columns.

use std::collections::HashSet;

use crate::column::{Column, ColumnData, Value};
use crate::error::{ColflowError, Result};
use crate::schema::ColumnType;

/// A concrete table produced by a reader or the materializer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let rows = columns.first().map_or(0, Column::len);
        let mut names = HashSet::new();
        for column in &columns {
            if !names.insert(column.name.as_str()) {
                return Err(ColflowError::collision(column.name.clone()));
            }
            if column.len() != rows {
                return Err(ColflowError::shape(format!(
                    "column '{}' has {} rows, expected {rows}",
                    column.name,
                    column.len()
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    /// Zero-row table with the given column names and types.
    pub fn empty<'a>(columns: impl IntoIterator<Item = (&'a str, ColumnType)>) -> Result<Self> {
        Self::new(
            columns
                .into_iter()
                .map(|(name, dtype)| Column::new(name, ColumnData::empty(dtype)))
                .collect(),
        )
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Add a new column. Names must be fresh and lengths must match; a table
    /// with no columns adopts the new column's length.
    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if self.contains(&column.name) {
            return Err(ColflowError::collision(column.name));
        }
        if !self.columns.is_empty() && column.len() != self.rows {
            return Err(ColflowError::shape(format!(
                "column '{}' has {} rows, expected {}",
                column.name,
                column.len(),
                self.rows
            )));
        }
        self.rows = column.len();
        self.columns.push(column);
        Ok(())
    }

    /// Project to `names`, in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let columns = names
            .iter()
            .map(|name| {
                self.column(name.as_ref())
                    .cloned()
                    .ok_or_else(|| ColflowError::shape(format!("no column '{}'", name.as_ref())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            rows: self.rows,
        })
    }

    /// Keep rows whose mask entry is `true`.
    pub fn filter(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.rows {
            return Err(ColflowError::shape(format!(
                "filter mask has {} entries for {} rows",
                mask.len(),
                self.rows
            )));
        }
        let columns: Vec<Column> = self
            .columns
            .iter()
            .map(|c| Column::new(c.name.clone(), c.data.filter(mask)))
            .collect();
        let rows = mask.iter().filter(|keep| **keep).count();
        Ok(Self { columns, rows })
    }

    /// Rows `[start, end)`, clamped to the table length.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.rows);
        let start = start.min(end);
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.slice(start, end)))
                .collect(),
            rows: end - start,
        }
    }

    /// Concatenate tables in order. All inputs must share column names and
    /// types in the same order.
    pub fn concat(tables: &[Table]) -> Result<Self> {
        let Some(first) = tables.first() else {
            return Ok(Self::default());
        };
        let mut columns = first.columns.clone();
        for table in &tables[1..] {
            if table.num_columns() != columns.len() {
                return Err(ColflowError::shape(format!(
                    "cannot concat table with {} columns onto {} columns",
                    table.num_columns(),
                    columns.len()
                )));
            }
            for (acc, next) in columns.iter_mut().zip(&table.columns) {
                if acc.name != next.name {
                    return Err(ColflowError::shape(format!(
                        "column order mismatch: '{}' vs '{}'",
                        acc.name, next.name
                    )));
                }
                acc.data.append(&next.data)?;
            }
        }
        let rows = tables.iter().map(Table::num_rows).sum();
        Ok(Self { columns, rows })
    }

    /// One row as cells in column order.
    pub fn row(&self, index: usize) -> Vec<Option<Value>> {
        self.columns.iter().map(|c| c.data.get(index)).collect()
    }
}
