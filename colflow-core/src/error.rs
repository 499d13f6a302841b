//! Error types for colflow.
//!
//! Uses `thiserror` for a single public error enum. Graph-construction
//! variants (`CyclicDependency`, `UnresolvedColumn`, `Collision`) are raised
//! synchronously while a pipeline is declared; read and transform variants are
//! raised per partition and wrapped in `PartitionFailure` by the materializer.

use std::path::PathBuf;

use crate::schema::ColumnType;
use crate::state::PartitionState;

/// Top-level error type for the colflow core library.
#[derive(Debug, thiserror::Error)]
pub enum ColflowError {
    #[error("No partitions matched pattern '{pattern}'")]
    NotFound { pattern: String },

    #[error(
        "Type mismatch in partition {partition}, column '{column}', row {row}: \
         cannot parse {value:?} as {expected}"
    )]
    TypeMismatch {
        partition: usize,
        column: String,
        row: usize,
        value: String,
        expected: ColumnType,
    },

    #[error("Partition {partition} ({}) is missing declared column '{column}'", path.display())]
    MissingColumn {
        partition: usize,
        path: PathBuf,
        column: String,
    },

    #[error("Cyclic dependency on column '{column}'")]
    CyclicDependency { column: String },

    #[error("Node '{node}' references unresolved name '{name}'")]
    UnresolvedColumn { node: String, name: String },

    #[error("Name '{name}' is already declared")]
    Collision { name: String },

    #[error("Partition {partition} failed: {source}")]
    PartitionFailure {
        partition: usize,
        #[source]
        source: Box<ColflowError>,
    },

    #[error("Illegal partition state transition {from} -> {to}")]
    InvalidTransition {
        from: PartitionState,
        to: PartitionState,
    },

    #[error("Transform '{node}' failed: {message}")]
    Transform { node: String, message: String },

    #[error("Table shape error: {message}")]
    Shape { message: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Write error: {message}")]
    Write { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Glob error: {0}")]
    Glob(#[from] globset::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ColflowError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    pub fn transform(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn collision(name: impl Into<String>) -> Self {
        Self::Collision { name: name.into() }
    }

    /// Wrap an error raised while processing one partition.
    pub fn partition(partition: usize, source: ColflowError) -> Self {
        Self::PartitionFailure {
            partition,
            source: Box::new(source),
        }
    }

    /// Whether this error was raised while declaring a pipeline graph.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. } | Self::UnresolvedColumn { .. } | Self::Collision { .. }
        )
    }
}

/// Result type alias for colflow operations.
pub type Result<T, E = ColflowError> = std::result::Result<T, E>;
