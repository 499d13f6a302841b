//! Declarative pipelines.
//!
//! A [`PipelineDefinition`] is a serializable description of a whole run:
//! input glob, schema, an ordered list of [`Step`]s, optional projection and
//! optional partitioned output. It loads from JSON or TOML and compiles to a
//! [`PipelineGraph`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::aggregate::AggregateOp;
use crate::column::Value;
use crate::config::OutputOptions;
use crate::context::PipelineContext;
use crate::error::{ColflowError, Result};
use crate::graph::{Node, PipelineBuilder, PipelineGraph, detect_cycle};
use crate::materialize::Materialized;
use crate::ops::{self, ArithOp, DatetimePart, UnaryOp};
use crate::query::RowPredicate;
use crate::schema::{ColumnType, Schema};
use crate::source::PartitionSource;

/// A transformation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Cast {
        input: String,
        output: String,
        to: ColumnType,
    },
    FillMissing {
        input: String,
        output: String,
        value: Value,
    },
    DropMissing {
        columns: Vec<String>,
    },
    Filter {
        #[serde(default = "default_filter_label")]
        label: String,
        predicate: RowPredicate,
    },
    Alias {
        input: String,
        suffix: String,
    },
    MinMaxScale {
        input: String,
        output: String,
    },
    Standardize {
        input: String,
        output: String,
    },
    Categorify {
        input: String,
        output: String,
    },
    DatetimePart {
        input: String,
        output: String,
        part: DatetimePart,
    },
    Arithmetic {
        left: String,
        right: String,
        output: String,
        #[serde(rename = "fn")]
        func: ArithOp,
    },
    Unary {
        input: String,
        output: String,
        #[serde(rename = "fn")]
        func: UnaryOp,
    },
    Aggregate {
        name: String,
        input: String,
        #[serde(rename = "fn")]
        func: AggregateOp,
    },
}

fn default_filter_label() -> String {
    "filter".to_string()
}

impl Step {
    /// Nodes this step declares, in order.
    pub fn nodes(&self) -> Vec<Node> {
        match self {
            Self::Cast { input, output, to } => vec![ops::cast(input, output, *to)],
            Self::FillMissing {
                input,
                output,
                value,
            } => vec![ops::fill_missing(input, output, value.clone())],
            Self::DropMissing { columns } => vec![ops::drop_missing(columns.as_slice())],
            Self::Filter { label, predicate } => {
                vec![ops::filter_where(label, predicate.clone())]
            }
            Self::Alias { input, suffix } => vec![ops::alias(input, suffix)],
            Self::MinMaxScale { input, output } => ops::min_max_scale(input, output),
            Self::Standardize { input, output } => ops::standardize(input, output),
            Self::Categorify { input, output } => ops::categorify(input, output),
            Self::DatetimePart {
                input,
                output,
                part,
            } => vec![ops::datetime_part(input, output, *part)],
            Self::Arithmetic {
                left,
                right,
                output,
                func,
            } => vec![ops::arithmetic(left, right, output, *func)],
            Self::Unary {
                input,
                output,
                func,
            } => vec![ops::unary(input, output, *func)],
            Self::Aggregate { name, input, func } => vec![Node::aggregate(name, input, *func)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub dir: PathBuf,
    /// Overrides `output.num_files` from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_files: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub input: InputDefinition,
    pub schema: Schema,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
}

impl PipelineDefinition {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ColflowError::config(format!("pipeline definition: {e}")))
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check names and dependencies and produce the graph. No partition is
    /// opened.
    pub fn compile(&self) -> Result<PipelineGraph> {
        let nodes: Vec<Node> = self.steps.iter().flat_map(Step::nodes).collect();
        let decls: Vec<_> = nodes
            .iter()
            .map(|n| {
                let deps = n.inputs().iter().chain(n.params()).cloned().collect();
                (n.outputs().to_vec(), deps)
            })
            .collect();
        detect_cycle(&decls)?;

        let mut builder = PipelineBuilder::new(self.schema.clone());
        builder.add_all(nodes)?;
        if let Some(select) = &self.select {
            builder.select(select.iter().cloned())?;
        }
        builder.build()
    }

    pub fn source(&self) -> Result<PartitionSource> {
        PartitionSource::discover(&self.input.pattern, self.schema.clone())
    }

    /// Configured output options with this definition's overrides applied.
    pub fn output_options(&self, base: &OutputOptions) -> OutputOptions {
        let mut options = base.clone();
        if let Some(n) = self.output.as_ref().and_then(|o| o.num_files) {
            options.num_files = n;
        }
        options
    }

    /// Compile, discover and materialize under `ctx`, writing files when an
    /// output directory is declared.
    pub async fn run(&self, ctx: &PipelineContext) -> Result<Materialized> {
        let graph = self.compile()?;
        let source = self.source()?;
        tracing::info!(pipeline = %self.name, steps = self.steps.len(), "running pipeline");
        match &self.output {
            Some(output) => {
                let options = self.output_options(&ctx.config().output);
                let materializer = ctx.materializer().with_output(options);
                materializer.evaluate_to_dir(&graph, &source, &output.dir).await
            }
            None => ctx.materializer().evaluate(&graph, &source).await,
        }
    }
}
