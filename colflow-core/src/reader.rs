//! Typed reader: parse one delimited partition under a schema.
//!
//! Sentinel substitution happens on the raw field text, per column, before any
//! typed parsing. A field that still fails to parse is a `TypeMismatch`
//! raised immediately; nothing is widened or defaulted.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::column::{Column, ColumnData};
use crate::config::{ReadOptions, as_byte};
use crate::error::{ColflowError, Result};
use crate::schema::{ColumnSpec, ColumnType, Schema};
use crate::source::Partition;
use crate::table::Table;

const FALLBACK_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

const FALLBACK_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Reads partitions into typed tables.
#[derive(Debug, Clone, Default)]
pub struct TypedReader {
    options: ReadOptions,
}

impl TypedReader {
    pub fn new(options: ReadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// Read a partition file, restricted to the schema's columns in schema order.
    pub fn read(&self, partition: &Partition, schema: &Schema) -> Result<Table> {
        let file = File::open(partition.path())?;
        let table = self.read_from(partition.id(), partition.path(), file, schema)?;
        tracing::debug!(
            partition = partition.id(),
            path = %partition.path().display(),
            rows = table.num_rows(),
            "read partition"
        );
        Ok(table)
    }

    /// Read from any byte stream; `label` is used in error messages.
    pub fn read_from<R: Read>(
        &self,
        partition: usize,
        label: &Path,
        input: R,
        schema: &Schema,
    ) -> Result<Table> {
        let mut builder = ReaderBuilder::new();
        builder
            .delimiter(as_byte(self.options.delimiter))
            .quote(as_byte(self.options.quote))
            .comment(self.options.comment.map(as_byte))
            .has_headers(self.options.has_header)
            .flexible(false)
            .trim(if self.options.trim { Trim::All } else { Trim::None });
        let mut rdr = builder.from_reader(input);

        let positions = if self.options.has_header {
            let headers = rdr.headers()?.clone();
            bind_by_header(partition, label, &headers, schema)?
        } else {
            (0..schema.len()).collect()
        };

        let mut builders: Vec<ColumnData> = schema
            .columns()
            .iter()
            .map(|spec| ColumnData::empty(spec.dtype))
            .collect();

        let mut record = StringRecord::new();
        let mut row = 0;
        while rdr.read_record(&mut record)? {
            for ((spec, &pos), data) in schema.columns().iter().zip(&positions).zip(&mut builders) {
                let Some(raw) = record.get(pos) else {
                    return Err(ColflowError::MissingColumn {
                        partition,
                        path: label.to_path_buf(),
                        column: spec.name.clone(),
                    });
                };
                push_raw(data, spec, raw, self.options.empty_as_missing).map_err(|()| {
                    ColflowError::TypeMismatch {
                        partition,
                        column: spec.name.clone(),
                        row,
                        value: raw.to_string(),
                        expected: spec.dtype,
                    }
                })?;
            }
            row += 1;
        }

        Table::new(
            schema
                .columns()
                .iter()
                .zip(builders)
                .map(|(spec, data)| Column::new(spec.name.clone(), data))
                .collect(),
        )
    }
}

fn bind_by_header(
    partition: usize,
    label: &Path,
    headers: &StringRecord,
    schema: &Schema,
) -> Result<Vec<usize>> {
    schema
        .columns()
        .iter()
        .map(|spec| {
            headers
                .iter()
                .position(|h| h == spec.name)
                .ok_or_else(|| ColflowError::MissingColumn {
                    partition,
                    path: label.to_path_buf(),
                    column: spec.name.clone(),
                })
        })
        .collect()
}

/// Append one raw field. `Err(())` means the text does not coerce.
fn push_raw(
    data: &mut ColumnData,
    spec: &ColumnSpec,
    raw: &str,
    empty_as_missing: bool,
) -> std::result::Result<(), ()> {
    if spec.is_sentinel(raw) {
        push_missing(data);
        return Ok(());
    }
    if raw.is_empty() && empty_as_missing && spec.dtype != ColumnType::Text {
        push_missing(data);
        return Ok(());
    }
    match data {
        ColumnData::Integer(v) => v.push(Some(raw.parse::<i64>().map_err(|_| ())?)),
        ColumnData::Float(v) => v.push(Some(raw.parse::<f64>().map_err(|_| ())?)),
        ColumnData::Text(v) => v.push(Some(raw.to_string())),
        ColumnData::Timestamp(v) => v.push(Some(
            parse_timestamp(raw, spec.format.as_deref()).ok_or(())?,
        )),
    }
    Ok(())
}

fn push_missing(data: &mut ColumnData) {
    match data {
        ColumnData::Integer(v) => v.push(None),
        ColumnData::Float(v) => v.push(None),
        ColumnData::Text(v) => v.push(None),
        ColumnData::Timestamp(v) => v.push(None),
    }
}

/// Parse a timestamp with an explicit format, or with RFC 3339 and the common
/// date/date-time layouts when none is declared. Date-only input is midnight.
pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    if let Some(format) = format {
        return NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(raw, format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            });
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    FALLBACK_TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            FALLBACK_DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
