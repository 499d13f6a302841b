//! Partitioned CSV output.
//!
//! A table of `R` rows is split into `N` contiguous row ranges; file `i`
//! receives rows `[i*R/N, (i+1)*R/N)`. Every file is written to a `.tmp`
//! sibling and synced; the set is renamed into place only when all files
//! succeeded, so a reader never observes a partial file or a partial set.

use serde::Serialize;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::column::{ColumnData, Value};
use crate::config::{ExecutionConfig, OutputOptions, as_byte};
use crate::error::{ColflowError, Result};
use crate::schema::{ColumnType, DEFAULT_TIMESTAMP_FORMAT, Schema};
use crate::table::Table;

/// One file produced by a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub rows: usize,
}

/// Row ranges for splitting `rows` into `files` contiguous groups.
pub fn row_ranges(rows: usize, files: usize) -> Vec<Range<usize>> {
    let files = files.max(1);
    (0..files)
        .map(|i| (i * rows / files)..((i + 1) * rows / files))
        .collect()
}

/// How absent and timestamp cells of one column are rendered.
#[derive(Debug, Clone)]
struct CellFormat {
    missing: String,
    timestamp_format: String,
}

#[derive(Debug, Clone)]
pub struct PartitionedWriter {
    options: OutputOptions,
    max_concurrent: usize,
    timeout: Duration,
}

impl PartitionedWriter {
    pub fn new(options: OutputOptions, execution: &ExecutionConfig) -> Self {
        Self {
            options,
            max_concurrent: execution.max_concurrent_partitions,
            timeout: execution.partition_timeout(),
        }
    }

    pub fn options(&self) -> &OutputOptions {
        &self.options
    }

    pub fn file_name(&self, index: usize) -> String {
        format!("{}-{index:05}.csv", self.options.file_prefix)
    }

    fn is_own_file(&self, name: &str) -> bool {
        name.strip_prefix(&self.options.file_prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|rest| rest.ends_with(".csv") || rest.ends_with(".tmp"))
    }

    /// Write `table` into `dir` as `num_files` files. Absent cells are
    /// written as the column's declared sentinel (or an empty field when
    /// none is declared, which reads back as absent for non-text columns).
    ///
    /// All files are staged as `.tmp` siblings first. Earlier output is
    /// replaced only once every file has been staged; on any failure the
    /// staged files are removed and the directory is left as it was.
    pub async fn write(
        &self,
        table: &Table,
        schema: &Schema,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<OutputFile>> {
        let formats = Arc::new(cell_formats(table, schema)?);
        let stale = self.prepare_dir(dir)?;

        let table = Arc::new(table.clone());
        let delimiter = as_byte(self.options.delimiter);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let timeout_secs = self.timeout.as_secs();
        // Tells blocking jobs that outlived their task to discard what they wrote.
        let abandon = CancellationToken::new();
        let mut staged = Vec::new();
        let mut handles = Vec::new();

        for (index, range) in row_ranges(table.num_rows(), self.options.num_files)
            .into_iter()
            .enumerate()
        {
            let path = dir.join(self.file_name(index));
            let tmp = path.with_extension("tmp");
            staged.push(tmp.clone());
            let table = Arc::clone(&table);
            let formats = Arc::clone(&formats);
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let abandon = abandon.clone();
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let permit = sem.acquire_owned().await.map_err(|_| ColflowError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(ColflowError::Cancelled);
                }
                let rows = range.len();
                let job = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let part = table.slice(range.start, range.end);
                    stage_file(&tmp, &part, &formats, delimiter, &abandon)
                });
                match tokio::time::timeout(timeout, job).await {
                    Ok(Ok(result)) => result.map(|()| OutputFile { path, rows }),
                    Ok(Err(join)) => Err(ColflowError::write(join.to_string())),
                    Err(_) => Err(ColflowError::Timeout {
                        operation: format!("writing {}", path.display()),
                        timeout_secs,
                    }),
                }
            }));
        }

        let mut files = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(file)) => files.push(file),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join) => {
                    first_error.get_or_insert(ColflowError::write(join.to_string()));
                }
            }
        }
        if first_error.is_none() && cancel.is_cancelled() {
            first_error = Some(ColflowError::Cancelled);
        }
        if let Some(e) = first_error {
            abandon.cancel();
            remove_all(&staged);
            tracing::warn!(dir = %dir.display(), error = %e, "partitioned write failed, staged files removed");
            return Err(e);
        }

        self.commit(&files, &stale)?;
        tracing::info!(
            dir = %dir.display(),
            files = files.len(),
            rows = table.num_rows(),
            "wrote partitioned output"
        );
        Ok(files)
    }

    /// Apply the overwrite policy and clear leftover `.tmp` files. Returns
    /// earlier output files, which are removed only at commit time.
    fn prepare_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut existing = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if self.is_own_file(&entry.file_name().to_string_lossy()) {
                existing.push(entry.path());
            }
        }
        if existing.is_empty() {
            return Ok(existing);
        }
        if !self.options.overwrite {
            return Err(ColflowError::write(format!(
                "{} already contains {} '{}-*' files and overwrite is off",
                dir.display(),
                existing.len(),
                self.options.file_prefix
            )));
        }
        let (tmps, stale): (Vec<_>, Vec<_>) = existing
            .into_iter()
            .partition(|p| p.extension().is_some_and(|e| e == "tmp"));
        for path in tmps {
            std::fs::remove_file(&path)?;
        }
        Ok(stale)
    }

    /// Replace earlier output with the staged files.
    fn commit(&self, files: &[OutputFile], stale: &[PathBuf]) -> Result<()> {
        for path in stale {
            std::fs::remove_file(path)?;
        }
        for (i, file) in files.iter().enumerate() {
            if let Err(e) = std::fs::rename(file.path.with_extension("tmp"), &file.path) {
                let done: Vec<PathBuf> = files[..i].iter().map(|f| f.path.clone()).collect();
                let pending: Vec<PathBuf> = files[i..]
                    .iter()
                    .map(|f| f.path.with_extension("tmp"))
                    .collect();
                remove_all(&done);
                remove_all(&pending);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "could not remove file");
            }
        }
    }
}

fn cell_formats(table: &Table, schema: &Schema) -> Result<Vec<CellFormat>> {
    table
        .columns()
        .iter()
        .map(|column| {
            let spec = schema.get(&column.name);
            let sentinel = spec.and_then(|s| s.sentinel.clone());
            if sentinel.is_none() && column.dtype() == ColumnType::Text && column.data.null_count() > 0 {
                return Err(ColflowError::write(format!(
                    "text column '{}' has absent values but no sentinel to write them as",
                    column.name
                )));
            }
            Ok(CellFormat {
                missing: sentinel.unwrap_or_default(),
                timestamp_format: spec
                    .map_or(DEFAULT_TIMESTAMP_FORMAT, |s| s.timestamp_format())
                    .to_string(),
            })
        })
        .collect()
}

fn render(data: &ColumnData, row: usize, format: &CellFormat) -> String {
    match data.get(row) {
        None => format.missing.clone(),
        Some(Value::Timestamp(t)) => t.format(&format.timestamp_format).to_string(),
        Some(other) => other.to_string(),
    }
}

fn stage_file(
    tmp: &Path,
    table: &Table,
    formats: &[CellFormat],
    delimiter: u8,
    abandon: &CancellationToken,
) -> Result<()> {
    let result = write_tmp(tmp, table, formats, delimiter);
    if result.is_err() || abandon.is_cancelled() {
        let _ = std::fs::remove_file(tmp);
    }
    result
}

fn write_tmp(tmp: &Path, table: &Table, formats: &[CellFormat], delimiter: u8) -> Result<()> {
    let file = File::create(tmp)?;
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(file);
    if table.num_columns() > 0 {
        wtr.write_record(table.column_names())?;
    }
    let mut record = Vec::with_capacity(table.num_columns());
    for row in 0..table.num_rows() {
        record.clear();
        record.extend(
            table
                .columns()
                .iter()
                .zip(formats)
                .map(|(column, format)| render(&column.data, row, format)),
        );
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    let file = wtr
        .into_inner()
        .map_err(|e| ColflowError::write(e.to_string()))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use crate::schema::ColumnSpec;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSpec::new("STATION", ColumnType::Text),
            ColumnSpec::new("VALUE", ColumnType::Integer).with_sentinel("-9999"),
        ])
        .unwrap()
    }

    fn table(rows: usize) -> Table {
        Table::new(vec![
            Column::new(
                "STATION",
                (0..rows).map(|i| Some(format!("S{i}"))).collect::<Vec<_>>(),
            ),
            Column::new(
                "VALUE",
                (0..rows)
                    .map(|i| if i % 3 == 0 { None } else { Some(i as i64) })
                    .collect::<Vec<_>>(),
            ),
        ])
        .unwrap()
    }

    fn writer(num_files: usize, overwrite: bool) -> PartitionedWriter {
        let options = OutputOptions {
            num_files,
            overwrite,
            ..OutputOptions::default()
        };
        PartitionedWriter::new(options, &ExecutionConfig::default())
    }

    #[test]
    fn test_row_ranges_are_contiguous_and_cover() {
        assert_eq!(row_ranges(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(row_ranges(2, 4), vec![0..0, 0..1, 1..1, 1..2]);
        assert_eq!(row_ranges(0, 2), vec![0..0, 0..0]);
    }

    #[tokio::test]
    async fn test_write_files_with_sentinel() {
        let dir = TempDir::new().unwrap();
        let files = writer(2, true)
            .write(&table(4), &schema(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].rows, 2);
        assert!(files[0].path.ends_with("part-00000.csv"));

        let first = std::fs::read_to_string(&files[0].path).unwrap();
        assert_eq!(first, "STATION,VALUE\nS0,-9999\nS1,1\n");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_policy() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        writer(3, true)
            .write(&table(6), &schema(), dir.path(), &token)
            .await
            .unwrap();
        // Fewer files replace all earlier ones.
        writer(1, true)
            .write(&table(6), &schema(), dir.path(), &token)
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let err = writer(1, false)
            .write(&table(6), &schema(), dir.path(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ColflowError::Write { .. }));
    }

    #[tokio::test]
    async fn test_text_without_sentinel_cannot_hold_absent() {
        let dir = TempDir::new().unwrap();
        let t = Table::new(vec![Column::new("STATION", vec![Some("A".to_string()), None])]).unwrap();
        let err = writer(1, true)
            .write(&t, &schema(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ColflowError::Write { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().unwrap().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_one_failed_file_leaves_no_partial_set() {
        let dir = TempDir::new().unwrap();
        // A directory where file 1 would be staged makes that file fail.
        std::fs::create_dir(dir.path().join("part-00001.tmp")).unwrap();

        let err = writer(3, true)
            .write(&table(9), &schema(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ColflowError::Io(_)));
        assert!(names(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_rewrite_keeps_previous_output() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        writer(2, true)
            .write(&table(4), &schema(), dir.path(), &token)
            .await
            .unwrap();
        let before = std::fs::read_to_string(dir.path().join("part-00000.csv")).unwrap();

        std::fs::create_dir(dir.path().join("part-00002.tmp")).unwrap();
        writer(3, true)
            .write(&table(9), &schema(), dir.path(), &token)
            .await
            .unwrap_err();

        assert_eq!(names(dir.path()), ["part-00000.csv", "part-00001.csv"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("part-00000.csv")).unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = writer(2, true)
            .write(&table(4), &schema(), dir.path(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ColflowError::Cancelled));
    }
}
