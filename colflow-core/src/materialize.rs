//! Materializer: evaluate a pipeline graph over every partition.
//!
//! Partitions run concurrently on blocking threads, bounded by a semaphore.
//! The graph is executed stage by stage; between stages the aggregate
//! partials of every live partition are merged in partition order, so each
//! stage boundary is a barrier. Output is the in-order concatenation of every
//! live partition's selected columns, optionally written as partitioned files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{AggregateState, AggregateValue};
use crate::column::Column;
use crate::config::{ColflowConfig, ExecutionConfig, FailureMode, OutputOptions};
use crate::error::{ColflowError, Result};
use crate::graph::{Node, NodeId, NodeInputs, NodeKind, PipelineGraph};
use crate::reader::TypedReader;
use crate::schema::{ColumnType, Schema};
use crate::source::{Partition, PartitionSource};
use crate::state::{PartitionRun, PartitionState};
use crate::table::Table;
use crate::writer::{OutputFile, PartitionedWriter};

/// A partition dropped under `FailureMode::SkipPartition`.
#[derive(Debug)]
pub struct FailedPartition {
    pub partition: usize,
    pub path: PathBuf,
    pub error: ColflowError,
}

/// Summary of one materialization run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Final lifecycle state of every partition, in source order.
    pub partitions: Vec<PartitionRun>,
    pub rows_out: usize,
    /// Files written by `evaluate_to_dir`; empty for in-memory runs.
    pub files: Vec<OutputFile>,
}

impl RunReport {
    pub fn failed_ids(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .filter(|p| p.state == PartitionState::Failed)
            .map(|p| p.partition)
            .collect()
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct Materialized {
    pub table: Table,
    /// Partitions skipped under `SkipPartition`, in source order.
    pub failed: Vec<FailedPartition>,
    /// Final value of every aggregate node, by name.
    pub aggregates: BTreeMap<String, AggregateValue>,
    /// Partitions of the run, with row counts filled in for those read.
    pub partitions: Vec<Partition>,
    pub report: RunReport,
}

impl Materialized {
    pub fn failed_ids(&self) -> Vec<usize> {
        self.failed.iter().map(|f| f.partition).collect()
    }
}

enum StageInput {
    Unread(Partition),
    Carried(Table),
}

struct StageOutput {
    table: Table,
    rows_read: Option<usize>,
    partials: Vec<(NodeId, AggregateState)>,
}

struct StageFailure {
    rows_read: Option<usize>,
    error: ColflowError,
}

impl From<ColflowError> for StageFailure {
    fn from(error: ColflowError) -> Self {
        Self {
            rows_read: None,
            error,
        }
    }
}

/// Shared, read-only state handed to every worker.
struct StageContext {
    graph: PipelineGraph,
    schema: Schema,
    reader: TypedReader,
}

#[derive(Debug, Clone)]
pub struct Materializer {
    reader: TypedReader,
    execution: ExecutionConfig,
    output: OutputOptions,
    cancellation: CancellationToken,
}

impl Materializer {
    pub fn new(config: &ColflowConfig) -> Self {
        Self {
            reader: TypedReader::new(config.read.clone()),
            execution: config.execution.clone(),
            output: config.output.clone(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Stop dispatching partition work once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_output(mut self, output: OutputOptions) -> Self {
        self.output = output;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Evaluate `graph` over every partition of `source` into one table.
    pub async fn evaluate(
        &self,
        graph: &PipelineGraph,
        source: &PartitionSource,
    ) -> Result<Materialized> {
        if graph.schema() != source.schema() {
            return Err(ColflowError::config(
                "pipeline graph and partition source use different schemas",
            ));
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(
            %run_id,
            pattern = source.pattern(),
            partitions = source.len(),
            stages = graph.stages().len(),
            "starting materialization"
        );

        let ctx = Arc::new(StageContext {
            graph: graph.clone(),
            schema: source.schema().clone(),
            reader: self.reader.clone(),
        });
        let run_token = self.cancellation.child_token();
        let mut partitions: Vec<Partition> = source.partitions().to_vec();

        let mut runs: Vec<PartitionRun> = partitions
            .iter()
            .map(|p| PartitionRun::new(p.id()))
            .collect();
        let mut tables: Vec<Option<Table>> = vec![None; partitions.len()];
        let mut failures: Vec<(usize, ColflowError)> = Vec::new();
        let mut params: HashMap<String, AggregateValue> = HashMap::new();

        for stage in 0..graph.stages().len() {
            let live: Vec<usize> = (0..runs.len()).filter(|&i| runs[i].is_live()).collect();
            if live.is_empty() {
                break;
            }

            let shared_params = Arc::new(params.clone());
            let semaphore = Arc::new(Semaphore::new(self.execution.max_concurrent_partitions));
            let mut handles = Vec::with_capacity(live.len());

            for &i in &live {
                let input = match tables[i].take() {
                    Some(table) => StageInput::Carried(table),
                    None => StageInput::Unread(partitions[i].clone()),
                };
                handles.push(tokio::spawn(run_partition_stage(
                    Arc::clone(&ctx),
                    stage,
                    partitions[i].id(),
                    input,
                    Arc::clone(&shared_params),
                    Arc::clone(&semaphore),
                    run_token.clone(),
                    self.execution.clone(),
                )));
            }

            let mut partials: Vec<Vec<(NodeId, AggregateState)>> = Vec::with_capacity(live.len());
            for (&i, handle) in live.iter().zip(handles) {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join) => Err(StageFailure::from(ColflowError::transform(
                        "worker",
                        join.to_string(),
                    ))),
                };
                let run = &mut runs[i];
                match outcome {
                    Ok(output) => {
                        if let Some(rows) = output.rows_read {
                            run.advance(PartitionState::Read)?;
                            run.rows_read = Some(rows);
                            partitions[i] = partitions[i].with_row_count(rows);
                        }
                        tables[i] = Some(output.table);
                        partials.push(output.partials);
                    }
                    Err(failure) => {
                        if let Some(rows) = failure.rows_read {
                            run.advance(PartitionState::Read)?;
                            run.rows_read = Some(rows);
                            partitions[i] = partitions[i].with_row_count(rows);
                        }
                        run.fail(&failure.error)?;
                        tracing::warn!(
                            %run_id,
                            partition = run.partition,
                            stage,
                            error = %failure.error,
                            "partition failed"
                        );
                        failures.push((i, failure.error));
                    }
                }
            }

            if self.cancellation.is_cancelled() {
                tracing::info!(%run_id, stage, "materialization cancelled");
                return Err(ColflowError::Cancelled);
            }
            if self.execution.failure_mode == FailureMode::AbortAll && !failures.is_empty() {
                return Err(abort_error(failures));
            }

            // Partials of partitions that fail in a later stage stay merged.
            params.extend(merge_partials(graph, partials)?);
        }

        let mut parts = Vec::new();
        for (i, run) in runs.iter_mut().enumerate() {
            if !run.is_live() {
                continue;
            }
            let Some(table) = tables[i].take() else {
                continue;
            };
            run.advance(PartitionState::Transformed)?;
            let selected = table.select(graph.output_columns())?;
            run.rows_out = Some(selected.num_rows());
            parts.push(selected);
        }
        let table = Table::concat(&parts)?;
        for run in runs.iter_mut().filter(|r| r.state == PartitionState::Transformed) {
            run.advance(PartitionState::Materialized)?;
        }

        let failed = failures
            .into_iter()
            .map(|(i, error)| FailedPartition {
                partition: partitions[i].id(),
                path: partitions[i].path().to_path_buf(),
                error,
            })
            .collect::<Vec<_>>();
        let aggregates = graph
            .nodes()
            .iter()
            .filter(|n| n.is_aggregate())
            .filter_map(|n| {
                let name = n.outputs().first()?;
                params.get(name).map(|v| (name.clone(), v.clone()))
            })
            .collect();

        let report = RunReport {
            run_id,
            started_at,
            duration: start.elapsed(),
            partitions: runs,
            rows_out: table.num_rows(),
            files: Vec::new(),
        };
        tracing::info!(
            %run_id,
            rows = report.rows_out,
            failed = failed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "materialization complete"
        );

        Ok(Materialized {
            table,
            failed,
            aggregates,
            partitions,
            report,
        })
    }

    /// Evaluate, then write the result into `dir` using the configured
    /// output options.
    pub async fn evaluate_to_dir(
        &self,
        graph: &PipelineGraph,
        source: &PartitionSource,
        dir: &Path,
    ) -> Result<Materialized> {
        let mut materialized = self.evaluate(graph, source).await?;
        let writer = PartitionedWriter::new(self.output.clone(), &self.execution);
        // With no surviving partition the table has no columns; write the
        // header anyway so the output reads back under the same schema.
        let header_only;
        let table = if materialized.table.num_columns() == 0 {
            header_only = Table::empty(graph.output_columns().iter().map(|name| {
                let dtype = graph
                    .schema()
                    .get(name)
                    .map_or(ColumnType::Text, |spec| spec.dtype);
                (name.as_str(), dtype)
            }))?;
            &header_only
        } else {
            &materialized.table
        };
        let files = writer
            .write(table, graph.schema(), dir, &self.cancellation)
            .await?;
        materialized.report.files = files;
        Ok(materialized)
    }
}

fn abort_error(failures: Vec<(usize, ColflowError)>) -> ColflowError {
    // Partitions stopped by the abort itself report `Cancelled`; surface the
    // failure that triggered it.
    let mut first_cancelled = None;
    for (i, error) in failures {
        if matches!(error, ColflowError::Cancelled) {
            first_cancelled.get_or_insert(i);
            continue;
        }
        return ColflowError::partition(i, error);
    }
    match first_cancelled {
        Some(i) => ColflowError::partition(i, ColflowError::Cancelled),
        None => ColflowError::Cancelled,
    }
}

fn merge_partials(
    graph: &PipelineGraph,
    partials: Vec<Vec<(NodeId, AggregateState)>>,
) -> Result<HashMap<String, AggregateValue>> {
    let mut merged: BTreeMap<NodeId, AggregateState> = BTreeMap::new();
    for partition in partials {
        for (id, state) in partition {
            match merged.remove(&id) {
                None => {
                    merged.insert(id, state);
                }
                Some(mut acc) => {
                    acc.merge(state)
                        .map_err(|e| ColflowError::transform(node_label(graph, id), e))?;
                    merged.insert(id, acc);
                }
            }
        }
    }
    Ok(merged
        .into_iter()
        .filter_map(|(id, state)| {
            let name = graph.node(id)?.outputs().first()?.clone();
            Some((name, state.finish()))
        })
        .collect())
}

fn node_label(graph: &PipelineGraph, id: NodeId) -> String {
    graph
        .node(id)
        .map_or_else(|| format!("#{id}"), |n| n.label().to_string())
}

#[allow(clippy::too_many_arguments)]
async fn run_partition_stage(
    ctx: Arc<StageContext>,
    stage: usize,
    partition: usize,
    input: StageInput,
    params: Arc<HashMap<String, AggregateValue>>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    execution: ExecutionConfig,
) -> std::result::Result<StageOutput, StageFailure> {
    let permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| ColflowError::Cancelled)?;
    if token.is_cancelled() {
        return Err(ColflowError::Cancelled.into());
    }

    let abort_on_failure = execution.failure_mode == FailureMode::AbortAll;
    let timeout = execution.partition_timeout();
    // The permit travels with the blocking job, so an abandoned job keeps
    // its slot until it actually returns.
    let job = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        run_stage(&ctx, stage, partition, input, &params)
    });

    let outcome: std::result::Result<StageOutput, StageFailure> = tokio::select! {
        _ = token.cancelled() => Err(ColflowError::Cancelled.into()),
        joined = tokio::time::timeout(timeout, job) => match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ColflowError::transform("worker", join.to_string()).into()),
            Err(_) => Err(ColflowError::Timeout {
                operation: format!("partition {partition} stage {stage}"),
                timeout_secs: execution.partition_timeout_secs,
            }
            .into()),
        },
    };

    let root_failure = matches!(&outcome, Err(f) if !matches!(f.error, ColflowError::Cancelled));
    if abort_on_failure && root_failure {
        token.cancel();
    }
    outcome
}

fn run_stage(
    ctx: &StageContext,
    stage: usize,
    partition: usize,
    input: StageInput,
    params: &HashMap<String, AggregateValue>,
) -> std::result::Result<StageOutput, StageFailure> {
    let (mut table, rows_read) = match input {
        StageInput::Unread(p) => {
            let table = ctx.reader.read(&p, &ctx.schema)?;
            let rows = table.num_rows();
            (table, Some(rows))
        }
        StageInput::Carried(table) => (table, None),
    };

    let mut partials = Vec::new();
    for &id in &ctx.graph.stages()[stage] {
        let Some(node) = ctx.graph.node(id) else {
            continue;
        };
        eval_node(id, node, &mut table, params, &mut partials)
            .map_err(|error| StageFailure { rows_read, error })?;
    }
    tracing::debug!(partition, stage, rows = table.num_rows(), "stage complete");
    Ok(StageOutput {
        table,
        rows_read,
        partials,
    })
}

fn eval_node(
    id: NodeId,
    node: &Node,
    table: &mut Table,
    params: &HashMap<String, AggregateValue>,
    partials: &mut Vec<(NodeId, AggregateState)>,
) -> Result<()> {
    let fail = |message: String| ColflowError::transform(node.label(), message);

    let columns = node
        .inputs()
        .iter()
        .map(|name| {
            table
                .column(name)
                .map(|c| &c.data)
                .ok_or_else(|| fail(format!("input column '{name}' is not available")))
        })
        .collect::<Result<Vec<_>>>()?;
    let node_params = node
        .params()
        .iter()
        .map(|name| {
            params
                .get(name)
                .ok_or_else(|| fail(format!("aggregate '{name}' has not been computed")))
        })
        .collect::<Result<Vec<_>>>()?;
    let rows = table.num_rows();
    let inputs = NodeInputs::new(columns, node_params, rows);

    match node.kind() {
        NodeKind::Derive(func) => {
            let outputs = func(&inputs).map_err(fail)?;
            if outputs.len() != node.outputs().len() {
                return Err(fail(format!(
                    "returned {} columns for {} outputs",
                    outputs.len(),
                    node.outputs().len()
                )));
            }
            if let Some(bad) = outputs.iter().find(|c| c.len() != rows) {
                return Err(fail(format!("returned {} rows, expected {rows}", bad.len())));
            }
            for (name, data) in node.outputs().iter().zip(outputs) {
                table.push_column(Column::new(name.clone(), data))?;
            }
        }
        NodeKind::Filter(func) => {
            let mask = func(&inputs).map_err(fail)?;
            if mask.len() != rows {
                return Err(fail(format!("returned {} flags for {rows} rows", mask.len())));
            }
            *table = table.filter(&mask)?;
        }
        NodeKind::Aggregate(op) => {
            let data = inputs.column(0).map_err(fail)?;
            let mut state = AggregateState::new(*op, data.dtype()).map_err(fail)?;
            state.update(data).map_err(fail)?;
            partials.push((id, state));
        }
    }
    Ok(())
}
