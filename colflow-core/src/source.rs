//! Partition source: enumerate file-backed partitions matching a glob.
//!
//! Only file metadata is touched here; contents are opened by the reader.

use globset::GlobBuilder;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{ColflowError, Result};
use crate::schema::Schema;

/// One independently readable chunk of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    id: usize,
    path: PathBuf,
    byte_len: u64,
    row_count: Option<usize>,
}

impl Partition {
    pub fn new(id: usize, path: impl Into<PathBuf>, byte_len: u64) -> Self {
        Self {
            id,
            path: path.into(),
            byte_len,
            row_count: None,
        }
    }

    /// Position in source order.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    /// Unknown until the partition has been read.
    pub fn row_count(&self) -> Option<usize> {
        self.row_count
    }

    /// Copy of this reference with the row count filled in.
    pub fn with_row_count(&self, rows: usize) -> Self {
        Self {
            row_count: Some(rows),
            ..self.clone()
        }
    }
}

/// Ordered partitions sharing one schema.
#[derive(Debug, Clone)]
pub struct PartitionSource {
    pattern: String,
    schema: Arc<Schema>,
    partitions: Vec<Partition>,
}

impl PartitionSource {
    /// Enumerate files matching `pattern`, sorted lexicographically by path.
    ///
    /// The pattern is split at its first component containing a wildcard:
    /// the literal prefix is walked, the rest is matched with `*` confined to
    /// one path component and `**` crossing directories.
    pub fn discover(pattern: &str, schema: Schema) -> Result<Self> {
        let paths = match split_pattern(pattern) {
            (root, None) => {
                if root.is_file() {
                    vec![root]
                } else {
                    Vec::new()
                }
            }
            (root, Some(rest)) => walk_matches(&root, &rest)?,
        };

        if paths.is_empty() {
            return Err(ColflowError::NotFound {
                pattern: pattern.to_string(),
            });
        }

        let mut sorted = paths;
        sorted.sort();
        let partitions = sorted
            .into_iter()
            .enumerate()
            .map(|(id, path)| {
                let byte_len = std::fs::metadata(&path)?.len();
                Ok(Partition::new(id, path, byte_len))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(pattern, partitions = partitions.len(), "discovered partitions");
        Ok(Self {
            pattern: pattern.to_string(),
            schema: Arc::new(schema),
            partitions,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

fn has_wildcard(part: &str) -> bool {
    part.contains(['*', '?', '[', '{'])
}

/// Split into (walk root, remaining glob). `None` means no wildcard at all.
fn split_pattern(pattern: &str) -> (PathBuf, Option<String>) {
    let path = Path::new(pattern);
    let mut root = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();
    for component in path.components() {
        let text = component.as_os_str().to_string_lossy();
        if rest.is_empty() && !has_wildcard(&text) {
            root.push(component);
        } else {
            rest.push(text.into_owned());
        }
    }
    if rest.is_empty() {
        return (root, None);
    }
    if root.as_os_str().is_empty() {
        root.push(Component::CurDir);
    }
    (root, Some(rest.join("/")))
}

fn walk_matches(root: &Path, rest: &str) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let matcher = GlobBuilder::new(rest)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    let mut walker = WalkDir::new(root).min_depth(1).follow_links(true);
    if !rest.contains("**") {
        walker = walker.max_depth(rest.split('/').count());
    }

    let mut matches = Vec::new();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.is_match(relative) {
            matches.push(entry.into_path());
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, ColumnType};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![ColumnSpec::new("a", ColumnType::Integer)]).unwrap()
    }

    fn touch(dir: &Path, name: &str) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "a\n1\n").unwrap();
    }

    #[test]
    fn test_split_pattern() {
        assert_eq!(
            split_pattern("data/raw/*.csv"),
            (PathBuf::from("data/raw"), Some("*.csv".to_string()))
        );
        assert_eq!(
            split_pattern("*.csv"),
            (PathBuf::from("."), Some("*.csv".to_string()))
        );
        assert_eq!(split_pattern("data/one.csv"), (PathBuf::from("data/one.csv"), None));
        assert_eq!(
            split_pattern("data/**/part-?.csv"),
            (PathBuf::from("data"), Some("**/part-?.csv".to_string()))
        );
    }

    #[test]
    fn test_discover_is_lexicographic() {
        let dir = TempDir::new().unwrap();
        for name in ["c.csv", "a.csv", "b.csv", "notes.txt"] {
            touch(dir.path(), name);
        }
        let pattern = format!("{}/*.csv", dir.path().display());
        let source = PartitionSource::discover(&pattern, schema()).unwrap();

        let names: Vec<_> = source
            .partitions()
            .iter()
            .map(|p| p.path().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "c.csv"]);
        let ids: Vec<_> = source.partitions().iter().map(Partition::id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(source.partitions().iter().all(|p| p.row_count().is_none()));
        assert_eq!(source.partitions()[0].byte_len(), 4);
    }

    #[test]
    fn test_single_star_does_not_cross_directories() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.csv");
        touch(dir.path(), "nested/inner.csv");

        let flat = format!("{}/*.csv", dir.path().display());
        assert_eq!(PartitionSource::discover(&flat, schema()).unwrap().len(), 1);

        let deep = format!("{}/**/*.csv", dir.path().display());
        assert_eq!(PartitionSource::discover(&deep, schema()).unwrap().len(), 2);
    }

    #[test]
    fn test_no_match_is_not_found() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.csv", dir.path().display());
        let err = PartitionSource::discover(&pattern, schema()).unwrap_err();
        assert!(matches!(err, ColflowError::NotFound { .. }));

        let missing_root = format!("{}/nope/*.csv", dir.path().display());
        assert!(matches!(
            PartitionSource::discover(&missing_root, schema()),
            Err(ColflowError::NotFound { .. })
        ));
    }

    #[test]
    fn test_literal_path() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "only.csv");
        let pattern = dir.path().join("only.csv");
        let source = PartitionSource::discover(&pattern.to_string_lossy(), schema()).unwrap();
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn test_with_row_count_leaves_original_untouched() {
        let partition = Partition::new(0, "x.csv", 10);
        let read = partition.with_row_count(3);
        assert_eq!(partition.row_count(), None);
        assert_eq!(read.row_count(), Some(3));
    }
}
