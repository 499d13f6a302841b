//! Lazy pipeline graph.
//!
//! A [`PipelineBuilder`] collects [`Node`]s against a schema and checks names
//! as each one is declared. [`PipelineBuilder::build`] freezes the declaration
//! into an immutable [`PipelineGraph`] with its topological order and barrier
//! stages precomputed. Nothing here touches partition data.
//!
//! Uses petgraph's `DiGraph` for dependency edges and ordering.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::aggregate::{AggregateOp, AggregateValue};
use crate::column::ColumnData;
use crate::error::{ColflowError, Result};
use crate::schema::Schema;

/// Index of a node in declaration order.
pub type NodeId = usize;

/// Pure column function: inputs in, one column per declared output back.
pub type DeriveFn =
    Arc<dyn Fn(&NodeInputs<'_>) -> std::result::Result<Vec<ColumnData>, String> + Send + Sync>;

/// Row predicate: one keep flag per input row.
pub type FilterFn =
    Arc<dyn Fn(&NodeInputs<'_>) -> std::result::Result<Vec<bool>, String> + Send + Sync>;

/// What a node function sees for one partition.
#[derive(Debug)]
pub struct NodeInputs<'a> {
    columns: Vec<&'a ColumnData>,
    params: Vec<&'a AggregateValue>,
    rows: usize,
}

impl<'a> NodeInputs<'a> {
    pub fn new(columns: Vec<&'a ColumnData>, params: Vec<&'a AggregateValue>, rows: usize) -> Self {
        Self {
            columns,
            params,
            rows,
        }
    }

    /// Input column `i`, in the order the node declared its inputs.
    pub fn column(&self, i: usize) -> std::result::Result<&'a ColumnData, String> {
        self.columns
            .get(i)
            .copied()
            .ok_or_else(|| format!("missing input column #{i}"))
    }

    /// Aggregate parameter `i`, in declaration order.
    pub fn param(&self, i: usize) -> std::result::Result<&'a AggregateValue, String> {
        self.params
            .get(i)
            .copied()
            .ok_or_else(|| format!("missing aggregate parameter #{i}"))
    }

    pub fn columns(&self) -> &[&'a ColumnData] {
        &self.columns
    }

    /// Row count of the partition at this point of the pipeline.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[derive(Clone)]
pub enum NodeKind {
    Derive(DeriveFn),
    Filter(FilterFn),
    Aggregate(AggregateOp),
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Derive(_) => f.write_str("Derive"),
            Self::Filter(_) => f.write_str("Filter"),
            Self::Aggregate(op) => write!(f, "Aggregate({op:?})"),
        }
    }
}

/// One declared transform.
#[derive(Debug, Clone)]
pub struct Node {
    label: String,
    inputs: Vec<String>,
    params: Vec<String>,
    outputs: Vec<String>,
    kind: NodeKind,
}

fn names<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl Node {
    /// A node producing new columns from `inputs`.
    pub fn derive<O, I, F>(outputs: O, inputs: I, func: F) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(&NodeInputs<'_>) -> std::result::Result<Vec<ColumnData>, String>
            + Send
            + Sync
            + 'static,
    {
        let outputs = names(outputs);
        Self {
            label: outputs.join(","),
            inputs: names(inputs),
            params: Vec::new(),
            outputs,
            kind: NodeKind::Derive(Arc::new(func)),
        }
    }

    /// A node keeping only the rows for which `func` returns `true`.
    pub fn filter<I, F>(label: impl Into<String>, inputs: I, func: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(&NodeInputs<'_>) -> std::result::Result<Vec<bool>, String> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            inputs: names(inputs),
            params: Vec::new(),
            outputs: Vec::new(),
            kind: NodeKind::Filter(Arc::new(func)),
        }
    }

    /// A named reduction of `input` across every partition.
    pub fn aggregate(name: impl Into<String>, input: impl Into<String>, op: AggregateOp) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            inputs: vec![input.into()],
            params: Vec::new(),
            outputs: vec![name],
            kind: NodeKind::Aggregate(op),
        }
    }

    /// Aggregates this node reads, in the order `NodeInputs::param` exposes them.
    pub fn with_params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = names(params);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Column names for derive nodes, the aggregate name for aggregates,
    /// nothing for filters.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, NodeKind::Aggregate(_))
    }

    pub fn is_filter(&self) -> bool {
        matches!(self.kind, NodeKind::Filter(_))
    }

    fn dependencies(&self) -> Vec<String> {
        self.inputs.iter().chain(&self.params).cloned().collect()
    }
}

/// Reject a set of `(outputs, dependencies)` declarations that contains a
/// dependency cycle, regardless of declaration order.
pub(crate) fn detect_cycle(decls: &[(Vec<String>, Vec<String>)]) -> Result<()> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let idx: Vec<NodeIndex> = (0..decls.len()).map(|i| graph.add_node(i)).collect();

    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, (outputs, _)) in decls.iter().enumerate() {
        for out in outputs {
            producer.entry(out.as_str()).or_insert(i);
        }
    }

    for (i, (outputs, deps)) in decls.iter().enumerate() {
        for dep in deps {
            if outputs.contains(dep) {
                return Err(ColflowError::CyclicDependency {
                    column: dep.clone(),
                });
            }
            if let Some(&p) = producer.get(dep.as_str()) {
                graph.add_edge(idx[p], idx[i], ());
            }
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let at = graph[cycle.node_id()];
        ColflowError::CyclicDependency {
            column: decls[at].0.first().cloned().unwrap_or_default(),
        }
    })
}

/// Declares a pipeline against a schema.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    schema: Arc<Schema>,
    nodes: Vec<Node>,
    /// Column name -> producing node (`None` for schema columns).
    columns: HashMap<String, Option<NodeId>>,
    aggregates: HashMap<String, NodeId>,
    select: Option<Vec<String>>,
}

impl PipelineBuilder {
    pub fn new(schema: Schema) -> Self {
        Self::with_schema(Arc::new(schema))
    }

    pub fn with_schema(schema: Arc<Schema>) -> Self {
        let columns = schema.names().map(|n| (n.to_string(), None)).collect();
        Self {
            schema,
            nodes: Vec::new(),
            columns,
            aggregates: HashMap::new(),
            select: None,
        }
    }

    /// Declare a whole set at once. The set is checked for cycles first, so
    /// mutually dependent nodes report `CyclicDependency` rather than the
    /// unresolved forward reference.
    pub fn from_nodes(schema: Schema, nodes: Vec<Node>) -> Result<Self> {
        let decls: Vec<_> = nodes
            .iter()
            .map(|n| (n.outputs.clone(), n.dependencies()))
            .collect();
        detect_cycle(&decls)?;
        let mut builder = Self::new(schema);
        builder.add_all(nodes)?;
        Ok(builder)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn has_aggregate(&self, name: &str) -> bool {
        self.aggregates.contains_key(name)
    }

    /// Declare one node. Inputs must name schema columns or outputs of nodes
    /// already declared; params must name declared aggregates.
    pub fn add(&mut self, node: Node) -> Result<NodeId> {
        for dep in node.inputs.iter().chain(&node.params) {
            if node.outputs.contains(dep) {
                return Err(ColflowError::CyclicDependency {
                    column: dep.clone(),
                });
            }
        }
        for input in &node.inputs {
            if !self.columns.contains_key(input) {
                return Err(ColflowError::UnresolvedColumn {
                    node: node.label.clone(),
                    name: input.clone(),
                });
            }
        }
        for param in &node.params {
            if !self.aggregates.contains_key(param) {
                return Err(ColflowError::UnresolvedColumn {
                    node: node.label.clone(),
                    name: param.clone(),
                });
            }
        }

        let mut fresh = HashSet::new();
        for out in &node.outputs {
            let taken = self.columns.contains_key(out) || self.aggregates.contains_key(out);
            if taken || !fresh.insert(out.as_str()) {
                return Err(ColflowError::collision(out.clone()));
            }
        }

        match node.kind {
            NodeKind::Derive(_) if node.outputs.is_empty() => {
                return Err(ColflowError::transform(&node.label, "declares no outputs"));
            }
            NodeKind::Aggregate(_) if node.inputs.len() != 1 => {
                return Err(ColflowError::transform(
                    &node.label,
                    "an aggregate reduces exactly one column",
                ));
            }
            _ => {}
        }

        let id = self.nodes.len();
        match node.kind {
            NodeKind::Aggregate(_) => {
                for out in &node.outputs {
                    self.aggregates.insert(out.clone(), id);
                }
            }
            _ => {
                for out in &node.outputs {
                    self.columns.insert(out.clone(), Some(id));
                }
            }
        }
        tracing::trace!(node = %node.label, id, "declared node");
        self.nodes.push(node);
        Ok(id)
    }

    pub fn add_all(&mut self, nodes: impl IntoIterator<Item = Node>) -> Result<Vec<NodeId>> {
        nodes.into_iter().map(|n| self.add(n)).collect()
    }

    pub fn derive<O, I, F>(&mut self, outputs: O, inputs: I, func: F) -> Result<NodeId>
    where
        O: IntoIterator,
        O::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(&NodeInputs<'_>) -> std::result::Result<Vec<ColumnData>, String>
            + Send
            + Sync
            + 'static,
    {
        self.add(Node::derive(outputs, inputs, func))
    }

    pub fn filter<I, F>(&mut self, label: &str, inputs: I, func: F) -> Result<NodeId>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(&NodeInputs<'_>) -> std::result::Result<Vec<bool>, String> + Send + Sync + 'static,
    {
        self.add(Node::filter(label, inputs, func))
    }

    pub fn aggregate(&mut self, name: &str, input: &str, op: AggregateOp) -> Result<NodeId> {
        self.add(Node::aggregate(name, input, op))
    }

    /// Restrict the materialized output to `columns`, in this order.
    pub fn select<I>(&mut self, columns: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let columns = names(columns);
        let mut seen = HashSet::new();
        for name in &columns {
            if !self.columns.contains_key(name) {
                return Err(ColflowError::UnresolvedColumn {
                    node: "select".to_string(),
                    name: name.clone(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(ColflowError::collision(name.clone()));
            }
        }
        self.select = Some(columns);
        Ok(())
    }

    /// Freeze the declaration. Only names and edges are computed.
    pub fn build(self) -> Result<PipelineGraph> {
        let n = self.nodes.len();
        let mut preds: Vec<Vec<NodeId>> = vec![Vec::new(); n];

        for (i, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(Some(p)) = self.columns.get(input) {
                    preds[i].push(*p);
                }
            }
            for param in &node.params {
                if let Some(&p) = self.aggregates.get(param) {
                    preds[i].push(p);
                }
            }
        }

        // A filter changes the row set: everything declared before it runs on
        // the unfiltered rows, everything after on the survivors.
        for f in (0..n).filter(|&f| self.nodes[f].is_filter()) {
            for j in 0..f {
                preds[f].push(j);
            }
            for p in preds.iter_mut().skip(f + 1) {
                p.push(f);
            }
        }
        for p in &mut preds {
            p.sort_unstable();
            p.dedup();
        }

        let mut graph: DiGraph<NodeId, ()> = DiGraph::with_capacity(n, 0);
        let idx: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
        for (i, ps) in preds.iter().enumerate() {
            for &p in ps {
                graph.add_edge(idx[p], idx[i], ());
            }
        }
        let order: Vec<NodeId> = toposort(&graph, None)
            .map_err(|cycle| ColflowError::CyclicDependency {
                column: self.nodes[graph[cycle.node_id()]]
                    .outputs
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            })?
            .into_iter()
            .map(|ix| graph[ix])
            .collect();

        let mut stage_of = vec![0usize; n];
        for &i in &order {
            stage_of[i] = preds[i]
                .iter()
                .map(|&p| stage_of[p] + usize::from(self.nodes[p].is_aggregate()))
                .max()
                .unwrap_or(0);
        }

        let output_columns = match self.select {
            Some(columns) => columns,
            None => self
                .schema
                .names()
                .map(str::to_string)
                .chain(
                    self.nodes
                        .iter()
                        .filter(|n| matches!(n.kind, NodeKind::Derive(_)))
                        .flat_map(|n| n.outputs.iter().cloned()),
                )
                .collect(),
        };

        let graph = PipelineGraph {
            schema: self.schema,
            nodes: self.nodes,
            preds,
            stages: Vec::new(),
            stage_of,
            order: Vec::new(),
            output_columns,
        };
        let graph = graph.with_order(order);
        tracing::debug!(
            nodes = graph.nodes.len(),
            stages = graph.stages.len(),
            "built pipeline graph"
        );
        Ok(graph)
    }
}

/// Immutable, validated pipeline. Cheap to clone; evaluated only by the
/// materializer.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    schema: Arc<Schema>,
    nodes: Vec<Node>,
    preds: Vec<Vec<NodeId>>,
    order: Vec<NodeId>,
    stage_of: Vec<usize>,
    stages: Vec<Vec<NodeId>>,
    output_columns: Vec<String>,
}

impl PipelineGraph {
    fn with_order(mut self, order: Vec<NodeId>) -> Self {
        let count = self.stage_of.iter().max().map_or(1, |m| m + 1);
        let mut stages = vec![Vec::new(); count];
        for &i in &order {
            stages[self.stage_of[i]].push(i);
        }
        self.order = order;
        self.stages = stages;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Direct upstream nodes, including filter ordering edges.
    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.preds.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Topological evaluation order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes grouped by barrier stage, each in evaluation order. Stage `k + 1`
    /// only starts once every aggregate of stage `k` has been combined across
    /// partitions. There is always at least one (possibly empty) stage.
    pub fn stages(&self) -> &[Vec<NodeId>] {
        &self.stages
    }

    pub fn output_columns(&self) -> &[String] {
        &self.output_columns
    }

    /// The same graph evaluated in another topological order.
    pub fn reordered(&self, order: Vec<NodeId>) -> Result<Self> {
        let n = self.nodes.len();
        let mut position = vec![usize::MAX; n];
        for (pos, &id) in order.iter().enumerate() {
            if id >= n || position[id] != usize::MAX {
                return Err(ColflowError::shape(format!(
                    "order is not a permutation of {n} nodes"
                )));
            }
            position[id] = pos;
        }
        if order.len() != n {
            return Err(ColflowError::shape(format!(
                "order is not a permutation of {n} nodes"
            )));
        }
        for (id, ps) in self.preds.iter().enumerate() {
            if let Some(&p) = ps.iter().find(|&&p| position[p] > position[id]) {
                return Err(ColflowError::shape(format!(
                    "node '{}' is ordered before its dependency '{}'",
                    self.nodes[id].label, self.nodes[p].label
                )));
            }
        }
        Ok(self.clone().with_order(order))
    }
}
