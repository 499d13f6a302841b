//! # Colflow Core
//!
//! Partitioned columnar transform pipeline.
//! Provides the partition source, typed reader with per-column sentinels,
//! lazy transform graph, cross-partition aggregates, the concurrent
//! materializer, partitioned CSV output, configuration and logging setup.

pub mod aggregate;
pub mod column;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod graph;
pub mod logging;
pub mod materialize;
pub mod ops;
pub mod query;
pub mod reader;
pub mod schema;
pub mod source;
pub mod state;
pub mod table;
pub mod writer;

// Re-export commonly used types at the crate root.
pub use aggregate::{AggregateOp, AggregateValue};
pub use column::{Column, ColumnData, Value};
pub use config::{
    ColflowConfig, ExecutionConfig, FailureMode, LoggingConfig, OutputOptions, ReadOptions,
    load_config,
};
pub use context::PipelineContext;
pub use definition::{PipelineDefinition, Step};
pub use error::{ColflowError, Result};
pub use graph::{Node, NodeId, NodeInputs, PipelineBuilder, PipelineGraph};
pub use materialize::{FailedPartition, Materialized, Materializer, RunReport};
pub use query::{ColumnQuery, CompareOp, RowPredicate};
pub use reader::TypedReader;
pub use schema::{ColumnSpec, ColumnType, Schema};
pub use source::{Partition, PartitionSource};
pub use state::{PartitionRun, PartitionState};
pub use table::Table;
pub use writer::{OutputFile, PartitionedWriter};
