//! Immutable logical plan trees.
//!
//! Plans are built bottom-up by wrapping an existing node and are never
//! mutated afterwards. They serialize to JSON for repro files.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::batch::RowBatch;
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStep {
    Single,
    Partial,
    Intermediate,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
            nulls_first: true,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} NULLS {}",
            self.column,
            if self.ascending { "ASC" } else { "DESC" },
            if self.nulls_first { "FIRST" } else { "LAST" }
        )
    }
}

fn write_call(
    f: &mut fmt::Formatter<'_>,
    function: &str,
    args: &[String],
    distinct: bool,
    sorting_keys: &[SortKey],
) -> fmt::Result {
    write!(f, "{function}(")?;
    if distinct {
        write!(f, "DISTINCT ")?;
    }
    if args.is_empty() && function == "count" {
        write!(f, "*")?;
    }
    write!(f, "{}", args.join(", "))?;
    if !sorting_keys.is_empty() {
        let keys: Vec<String> = sorting_keys.iter().map(ToString::to_string).collect();
        write!(f, " ORDER BY {}", keys.join(", "))?;
    }
    write!(f, ")")
}

/// One aggregate function call. No arguments means `count(*)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCall {
    pub function: String,
    pub args: Vec<String>,
    pub arg_types: Vec<DataType>,
    pub result_type: DataType,
    pub distinct: bool,
    /// ORDER BY inside the call, for order-sensitive functions.
    pub sorting_keys: Vec<SortKey>,
    pub output: String,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_call(
            f,
            &self.function,
            &self.args,
            self.distinct,
            &self.sorting_keys,
        )?;
        write!(f, " AS {}", self.output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE")]
pub enum FrameKind {
    Rows,
    Range,
}

/// Frame offset, either a literal or a per-row column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOffset {
    Constant(i64),
    Column(String),
}

impl fmt::Display for FrameOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameOffset::Constant(v) => write!(f, "{v}"),
            FrameOffset::Column(c) => write!(f, "{c}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(FrameOffset),
    CurrentRow,
    Following(FrameOffset),
    UnboundedFollowing,
}

impl FrameBound {
    pub fn offset(&self) -> Option<&FrameOffset> {
        match self {
            FrameBound::Preceding(offset) | FrameBound::Following(offset) => Some(offset),
            _ => None,
        }
    }
}

impl fmt::Display for FrameBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameBound::UnboundedPreceding => write!(f, "UNBOUNDED PRECEDING"),
            FrameBound::Preceding(offset) => write!(f, "{offset} PRECEDING"),
            FrameBound::CurrentRow => write!(f, "CURRENT ROW"),
            FrameBound::Following(offset) => write!(f, "{offset} FOLLOWING"),
            FrameBound::UnboundedFollowing => write!(f, "UNBOUNDED FOLLOWING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub start: FrameBound,
    pub end: FrameBound,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            kind: FrameKind::Range,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BETWEEN {} AND {}", self.kind, self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCall {
    pub function: String,
    pub args: Vec<String>,
    pub arg_types: Vec<DataType>,
    pub result_type: DataType,
    pub frame: Frame,
    pub output: String,
}

impl fmt::Display for WindowCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_call(f, &self.function, &self.args, false, &[])?;
        write!(f, " {} AS {}", self.frame, self.output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    /// In-memory input batches.
    Values { batches: Vec<RowBatch> },
    /// Reads the splits supplied at execution time.
    TableScan { output: Vec<(String, DataType)> },
    OrderBy {
        keys: Vec<SortKey>,
        source: Box<PlanNode>,
    },
    Aggregation {
        step: AggregationStep,
        grouping_keys: Vec<String>,
        aggregates: Vec<AggregateCall>,
        /// Input arrives clustered on the grouping keys.
        streaming: bool,
        source: Box<PlanNode>,
    },
    Window {
        partition_keys: Vec<String>,
        sorting_keys: Vec<SortKey>,
        functions: Vec<WindowCall>,
        /// Input arrives sorted on partition and sorting keys.
        inputs_sorted: bool,
        source: Box<PlanNode>,
    },
}

impl PlanNode {
    pub fn values(batches: Vec<RowBatch>) -> Self {
        PlanNode::Values { batches }
    }

    pub fn table_scan(output: Vec<(String, DataType)>) -> Self {
        PlanNode::TableScan { output }
    }

    pub fn order_by(self, keys: Vec<SortKey>) -> Self {
        PlanNode::OrderBy {
            keys,
            source: Box::new(self),
        }
    }

    pub fn aggregation(
        self,
        step: AggregationStep,
        grouping_keys: &[String],
        aggregates: &[AggregateCall],
        streaming: bool,
    ) -> Self {
        PlanNode::Aggregation {
            step,
            grouping_keys: grouping_keys.to_vec(),
            aggregates: aggregates.to_vec(),
            streaming,
            source: Box::new(self),
        }
    }

    pub fn window(
        self,
        partition_keys: &[String],
        sorting_keys: &[SortKey],
        functions: &[WindowCall],
        inputs_sorted: bool,
    ) -> Self {
        PlanNode::Window {
            partition_keys: partition_keys.to_vec(),
            sorting_keys: sorting_keys.to_vec(),
            functions: functions.to_vec(),
            inputs_sorted,
            source: Box::new(self),
        }
    }

    pub fn source(&self) -> Option<&PlanNode> {
        match self {
            PlanNode::Values { .. } | PlanNode::TableScan { .. } => None,
            PlanNode::OrderBy { source, .. }
            | PlanNode::Aggregation { source, .. }
            | PlanNode::Window { source, .. } => Some(&**source),
        }
    }

    /// Nodes from the root down to the leaf.
    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        std::iter::successors(Some(self), |&node| node.source())
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlanNode::Values { .. } => "Values",
            PlanNode::TableScan { .. } => "TableScan",
            PlanNode::OrderBy { .. } => "OrderBy",
            PlanNode::Aggregation { .. } => "Aggregation",
            PlanNode::Window { .. } => "Window",
        }
    }

    /// Output columns, or `None` for partial and intermediate aggregations
    /// whose output is accumulator state.
    pub fn output_schema(&self) -> Option<Vec<(String, DataType)>> {
        match self {
            PlanNode::Values { batches } => Some(
                batches
                    .first()
                    .map(RowBatch::schema)
                    .unwrap_or_default(),
            ),
            PlanNode::TableScan { output } => Some(output.clone()),
            PlanNode::OrderBy { source, .. } => source.output_schema(),
            PlanNode::Aggregation {
                step,
                grouping_keys,
                aggregates,
                source,
                ..
            } => {
                if matches!(
                    step,
                    AggregationStep::Partial | AggregationStep::Intermediate
                ) {
                    return None;
                }
                let input = source.input_schema()?;
                let mut schema = Vec::with_capacity(grouping_keys.len() + aggregates.len());
                for key in grouping_keys {
                    let (_, ty) = input.iter().find(|(name, _)| name == key)?;
                    schema.push((key.clone(), ty.clone()));
                }
                schema.extend(
                    aggregates
                        .iter()
                        .map(|a| (a.output.clone(), a.result_type.clone())),
                );
                Some(schema)
            }
            PlanNode::Window {
                functions, source, ..
            } => {
                let mut schema = source.output_schema()?;
                schema.extend(
                    functions
                        .iter()
                        .map(|w| (w.output.clone(), w.result_type.clone())),
                );
                Some(schema)
            }
        }
    }

    /// Schema of the raw rows feeding this subtree's aggregation chain.
    fn input_schema(&self) -> Option<Vec<(String, DataType)>> {
        match self {
            PlanNode::Aggregation { source, .. } => source.input_schema(),
            other => other.output_schema(),
        }
    }

    pub fn aggregate_function_names(&self) -> Vec<&str> {
        self.nodes()
            .flat_map(|node| match node {
                PlanNode::Aggregation { aggregates, .. } => {
                    aggregates.iter().map(|a| a.function.as_str()).collect()
                }
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn window_function_names(&self) -> Vec<&str> {
        self.nodes()
            .flat_map(|node| match node {
                PlanNode::Window { functions, .. } => {
                    functions.iter().map(|w| w.function.as_str()).collect()
                }
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn has_step(&self, wanted: AggregationStep) -> bool {
        self.nodes()
            .any(|node| matches!(node, PlanNode::Aggregation { step, .. } if *step == wanted))
    }

    pub fn reads_splits(&self) -> bool {
        self.nodes()
            .any(|node| matches!(node, PlanNode::TableScan { .. }))
    }

    /// Whether the row order of the output is defined.
    pub fn is_ordered(&self) -> bool {
        matches!(self, PlanNode::OrderBy { .. })
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}-- {}", "", self.name(), indent = depth * 2)?;
        match self {
            PlanNode::Values { batches } => {
                let rows: usize = batches.iter().map(RowBatch::num_rows).sum();
                writeln!(f, "[{} batches, {rows} rows]", batches.len())?;
            }
            PlanNode::TableScan { output } => {
                let columns: Vec<String> =
                    output.iter().map(|(n, t)| format!("{n}:{t}")).collect();
                writeln!(f, "[{}]", columns.join(", "))?;
            }
            PlanNode::OrderBy { keys, .. } => {
                let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                writeln!(f, "[{}]", keys.join(", "))?;
            }
            PlanNode::Aggregation {
                step,
                grouping_keys,
                aggregates,
                streaming,
                ..
            } => {
                let calls: Vec<String> = aggregates.iter().map(ToString::to_string).collect();
                writeln!(
                    f,
                    "[{step}{}] keys: [{}] {}",
                    if *streaming { " STREAMING" } else { "" },
                    grouping_keys.join(", "),
                    calls.join(", ")
                )?;
            }
            PlanNode::Window {
                partition_keys,
                sorting_keys,
                functions,
                inputs_sorted,
                ..
            } => {
                let keys: Vec<String> = sorting_keys.iter().map(ToString::to_string).collect();
                let calls: Vec<String> = functions.iter().map(ToString::to_string).collect();
                writeln!(
                    f,
                    "[{}partition by: [{}] order by: [{}]] {}",
                    if *inputs_sorted { "SORTED " } else { "" },
                    partition_keys.join(", "),
                    keys.join(", "),
                    calls.join(", ")
                )?;
            }
        }
        if let Some(source) = self.source() {
            source.fmt_node(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, 0)
    }
}
