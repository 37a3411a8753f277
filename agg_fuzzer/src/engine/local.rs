//! In-process columnar engine.
//!
//! `LocalEngine` interprets [`PlanNode`] trees directly. It implements every
//! physical strategy the fuzzer asks for: single, partial, intermediate and
//! final aggregation steps, streaming aggregation over clustered input,
//! spilling of aggregation state and sort runs to disk, partial aggregation
//! abandonment and multi-driver execution on scoped threads.

use std::collections::VecDeque;
use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::batch::RowBatch;
use crate::engine::accumulator::Accumulator;
use crate::engine::window::{evaluate_partition, BoundSortKeys, BoundWindowCall};
use crate::engine::{compare_by_keys, ExecutionOptions, QueryEngine};
use crate::error::EngineError;
use crate::plan::{AggregateCall, AggregationStep, FrameOffset, PlanNode, SortKey, WindowCall};
use crate::splits::{read_split, Split};
use crate::types::{DataType, Value};

/// Config key: number of groups or rows held in memory before a spill.
pub const SPILL_RUN_ROWS_CONFIG: &str = "spill_run_rows";
const DEFAULT_SPILL_RUN_ROWS: usize = 64;

type Schema = Vec<(String, DataType)>;
type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Default, Clone)]
pub struct LocalEngine;

impl LocalEngine {
    pub fn new() -> Self {
        Self
    }
}

impl QueryEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(
        &self,
        plan: &PlanNode,
        splits: &[Split],
        options: &ExecutionOptions,
    ) -> EngineResult<RowBatch> {
        let spill_run_rows = match options.configs.get(SPILL_RUN_ROWS_CONFIG) {
            Some(v) => parse_spill_run_rows(v)?,
            None => DEFAULT_SPILL_RUN_ROWS,
        };
        let spill_directory = match (options.inject_spill, &options.spill_directory) {
            (false, _) => None,
            (true, Some(dir)) => Some(dir.clone()),
            (true, None) => {
                return Err(EngineError::Runtime(
                    "spilling requested without a spill directory".to_string(),
                ));
            }
        };
        let ctx = Context {
            splits,
            max_drivers: options.max_drivers.max(1),
            abandon_partial: options.abandon_partial,
            spill_directory,
            spill_run_rows,
            spill_files: AtomicUsize::new(0),
        };
        match evaluate(plan, &ctx)? {
            Intermediate::Rows(table) => RowBatch::from_rows(&table.schema, table.rows),
            Intermediate::States(_) => Err(EngineError::Runtime(
                "plan ends in a partial aggregation".to_string(),
            )),
        }
    }
}

fn parse_spill_run_rows(value: &str) -> EngineResult<usize> {
    match value.parse::<usize>() {
        Ok(rows) if rows > 0 => Ok(rows),
        _ => Err(EngineError::User(format!("invalid {SPILL_RUN_ROWS_CONFIG}: {value}"))),
    }
}

struct Context<'a> {
    splits: &'a [Split],
    max_drivers: usize,
    abandon_partial: bool,
    spill_directory: Option<PathBuf>,
    spill_run_rows: usize,
    spill_files: AtomicUsize,
}

impl Context<'_> {
    fn spiller(&self) -> Option<Spiller<'_>> {
        self.spill_directory.as_deref().map(|dir| Spiller {
            dir,
            counter: &self.spill_files,
            run_rows: self.spill_run_rows,
            files: Vec::new(),
        })
    }
}

struct Table {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn index_of(&self, name: &str) -> EngineResult<usize> {
        column_index(&self.schema, name)
    }
}

fn column_index(schema: &Schema, name: &str) -> EngineResult<usize> {
    schema
        .iter()
        .position(|(n, _)| n == name)
        .ok_or_else(|| EngineError::Runtime(format!("unknown column {name}")))
}

/// Accumulator state of one aggregate within one group. DISTINCT calls
/// collect their argument tuples and only feed the accumulator at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupState {
    accumulator: Accumulator,
    distinct: Option<IndexSet<Vec<Value>>>,
}

impl GroupState {
    fn add_input(&mut self, args: Vec<Value>) -> EngineResult<()> {
        match &mut self.distinct {
            Some(seen) => {
                seen.insert(args);
                Ok(())
            }
            None => self.accumulator.add_input(&args),
        }
    }

    fn merge(&mut self, other: GroupState) -> EngineResult<()> {
        match (&mut self.distinct, other.distinct) {
            (Some(seen), Some(other_seen)) => {
                seen.extend(other_seen);
                Ok(())
            }
            (None, None) => self.accumulator.merge(other.accumulator),
            _ => Err(EngineError::Runtime(
                "cannot merge distinct and non-distinct state".to_string(),
            )),
        }
    }

    fn finalize(&self, call: &AggregateCall) -> EngineResult<Value> {
        match &self.distinct {
            Some(seen) => {
                let mut accumulator = self.accumulator.clone();
                for args in seen {
                    accumulator.add_input(args)?;
                }
                accumulator.finalize(&call.result_type)
            }
            None => self.accumulator.finalize(&call.result_type),
        }
    }
}

type GroupEntry = (Vec<Value>, Vec<GroupState>);

/// Output of partial and intermediate steps. A key may appear more than
/// once, e.g. once per driver.
struct PartialStates {
    key_schema: Schema,
    entries: Vec<GroupEntry>,
}

enum Intermediate {
    Rows(Table),
    States(PartialStates),
}

fn evaluate(plan: &PlanNode, ctx: &Context<'_>) -> EngineResult<Intermediate> {
    match plan {
        PlanNode::Values { batches } => {
            let batch = RowBatch::concat(batches)?;
            Ok(Intermediate::Rows(Table {
                schema: batch.schema(),
                rows: batch.rows(),
            }))
        }
        PlanNode::TableScan { output } => {
            let mut rows = Vec::new();
            for split in ctx.splits {
                let batch = read_split(split).map_err(|e| {
                    EngineError::Runtime(format!("failed to read {}: {e}", split.path.display()))
                })?;
                if batch.schema() != *output {
                    return Err(EngineError::Runtime(format!(
                        "split {} does not match the scan schema",
                        split.path.display()
                    )));
                }
                rows.extend(batch.rows());
            }
            Ok(Intermediate::Rows(Table {
                schema: output.clone(),
                rows,
            }))
        }
        PlanNode::OrderBy { keys, source } => {
            let mut table = expect_rows(evaluate(source, ctx)?)?;
            let keys = bind_sort_keys(&table.schema, keys)?;
            table.rows = match ctx.spiller() {
                Some(spiller) => sort_with_spill(table.rows, &keys, spiller)?,
                None => {
                    let mut rows = table.rows;
                    rows.sort_by(|a, b| compare_by_keys(a, b, &keys));
                    rows
                }
            };
            Ok(Intermediate::Rows(table))
        }
        PlanNode::Aggregation {
            step,
            grouping_keys,
            aggregates,
            streaming,
            source,
        } => {
            let input = evaluate(source, ctx)?;
            aggregate(*step, grouping_keys, aggregates, *streaming, input, ctx)
        }
        PlanNode::Window {
            partition_keys,
            sorting_keys,
            functions,
            inputs_sorted,
            source,
        } => {
            let table = expect_rows(evaluate(source, ctx)?)?;
            window(
                table,
                partition_keys,
                sorting_keys,
                functions,
                *inputs_sorted,
                ctx,
            )
            .map(Intermediate::Rows)
        }
    }
}

fn expect_rows(input: Intermediate) -> EngineResult<Table> {
    match input {
        Intermediate::Rows(table) => Ok(table),
        Intermediate::States(_) => Err(EngineError::Runtime(
            "expected rows but got partial aggregation state".to_string(),
        )),
    }
}

fn expect_states(input: Intermediate) -> EngineResult<PartialStates> {
    match input {
        Intermediate::States(states) => Ok(states),
        Intermediate::Rows(_) => Err(EngineError::Runtime(
            "expected partial aggregation state but got rows".to_string(),
        )),
    }
}

fn bind_sort_keys(schema: &Schema, keys: &[SortKey]) -> EngineResult<BoundSortKeys> {
    keys.iter()
        .map(|k| Ok((column_index(schema, &k.column)?, k.ascending, k.nulls_first)))
        .collect()
}

/// Runs `work` over `shards` on at most `max_drivers` scoped threads and
/// returns the results in shard order. A panicking driver panics the caller.
fn run_drivers<S, T, F>(shards: Vec<S>, work: F) -> Vec<T>
where
    S: Send,
    T: Send,
    F: Fn(S) -> T + Sync,
{
    if shards.len() <= 1 {
        return shards.into_iter().map(work).collect();
    }
    std::thread::scope(|scope| {
        let work = &work;
        let handles: Vec<_> = shards
            .into_iter()
            .map(|shard| scope.spawn(move || work(shard)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

/// Splits rows into contiguous, order preserving chunks.
fn contiguous_shards(rows: Vec<Vec<Value>>, num_drivers: usize) -> Vec<Vec<Vec<Value>>> {
    if rows.is_empty() {
        return vec![rows];
    }
    let chunk = rows.len().div_ceil(num_drivers);
    let mut shards = Vec::with_capacity(num_drivers);
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        shards.push(rows.by_ref().take(chunk).collect());
    }
    shards
}

fn hash_key(key: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// ------------------------------------------------------------------------
// Aggregation
// ------------------------------------------------------------------------

struct BoundAggregate<'a> {
    call: &'a AggregateCall,
    args: Vec<usize>,
}

impl BoundAggregate<'_> {
    fn new_state(&self) -> EngineResult<GroupState> {
        Ok(GroupState {
            accumulator: Accumulator::new(&self.call.function, &self.call.arg_types)?,
            distinct: self.call.distinct.then(IndexSet::new),
        })
    }
}

fn new_states(aggregates: &[BoundAggregate<'_>]) -> EngineResult<Vec<GroupState>> {
    aggregates.iter().map(BoundAggregate::new_state).collect()
}

fn add_row(
    states: &mut [GroupState],
    aggregates: &[BoundAggregate<'_>],
    row: &[Value],
) -> EngineResult<()> {
    for (state, aggregate) in states.iter_mut().zip(aggregates) {
        let args = aggregate.args.iter().map(|&i| row[i].clone()).collect();
        state.add_input(args)?;
    }
    Ok(())
}

fn merge_states(states: &mut [GroupState], other: Vec<GroupState>) -> EngineResult<()> {
    if states.len() != other.len() {
        return Err(EngineError::Runtime(format!(
            "cannot merge {} states into {}",
            other.len(),
            states.len()
        )));
    }
    for (state, other) in states.iter_mut().zip(other) {
        state.merge(other)?;
    }
    Ok(())
}

fn aggregate(
    step: AggregationStep,
    grouping_keys: &[String],
    calls: &[AggregateCall],
    streaming: bool,
    input: Intermediate,
    ctx: &Context<'_>,
) -> EngineResult<Intermediate> {
    let global = grouping_keys.is_empty();
    match step {
        AggregationStep::Single | AggregationStep::Partial => {
            let mut table = expect_rows(input)?;
            let key_indices = grouping_keys
                .iter()
                .map(|k| table.index_of(k))
                .collect::<EngineResult<Vec<_>>>()?;
            let key_schema: Schema = key_indices
                .iter()
                .map(|&i| table.schema[i].clone())
                .collect();
            let aggregates = calls
                .iter()
                .map(|call| {
                    Ok(BoundAggregate {
                        call,
                        args: call
                            .args
                            .iter()
                            .map(|a| table.index_of(a))
                            .collect::<EngineResult<Vec<_>>>()?,
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;

            // ORDER BY inside an aggregate call: feed rows in that order. Rows
            // stay clustered by grouping key for streaming aggregation.
            if let Some(call) = calls.iter().find(|c| !c.sorting_keys.is_empty()) {
                let mut keys: BoundSortKeys =
                    key_indices.iter().map(|&i| (i, true, true)).collect();
                keys.extend(bind_sort_keys(&table.schema, &call.sorting_keys)?);
                table.rows.sort_by(|a, b| compare_by_keys(a, b, &keys));
            }

            let key_of = |row: &[Value]| -> Vec<Value> {
                key_indices.iter().map(|&i| row[i].clone()).collect()
            };

            if step == AggregationStep::Partial {
                let shards = contiguous_shards(table.rows, ctx.max_drivers);
                let results = run_drivers(shards, |rows| -> EngineResult<Vec<GroupEntry>> {
                    if ctx.abandon_partial {
                        rows.iter()
                            .map(|row| {
                                let mut states = new_states(&aggregates)?;
                                add_row(&mut states, &aggregates, row)?;
                                Ok((key_of(row), states))
                            })
                            .collect()
                    } else {
                        let mut table = HashAggregator::new(&aggregates, None);
                        for row in &rows {
                            table.add_row(key_of(row), row)?;
                        }
                        Ok(table.finish(false)?.into_iter().collect())
                    }
                });
                let mut entries = Vec::new();
                for result in results {
                    entries.extend(result?);
                }
                return Ok(Intermediate::States(PartialStates {
                    key_schema,
                    entries,
                }));
            }

            let groups = if streaming {
                streaming_aggregate(&table.rows, &aggregates, key_of, global)?
            } else {
                let shards: Vec<Vec<Vec<Value>>> = if ctx.max_drivers > 1 && !global {
                    let mut shards = vec![Vec::new(); ctx.max_drivers];
                    for row in table.rows {
                        let driver = (hash_key(&key_of(&row)) % ctx.max_drivers as u64) as usize;
                        shards[driver].push(row);
                    }
                    shards
                } else {
                    vec![table.rows]
                };
                let results = run_drivers(shards, |rows| -> EngineResult<Vec<GroupEntry>> {
                    let mut table = HashAggregator::new(&aggregates, ctx.spiller());
                    for row in &rows {
                        table.add_row(key_of(row), row)?;
                    }
                    Ok(table.finish(global)?.into_iter().collect())
                });
                let mut groups = Vec::new();
                for result in results {
                    groups.extend(result?);
                }
                groups
            };
            finalize_groups(key_schema, groups, calls).map(Intermediate::Rows)
        }
        AggregationStep::Intermediate | AggregationStep::Final => {
            let states = expect_states(input)?;
            let aggregates: Vec<BoundAggregate<'_>> = calls
                .iter()
                .map(|call| BoundAggregate {
                    call,
                    args: Vec::new(),
                })
                .collect();
            let spiller = if step == AggregationStep::Final {
                ctx.spiller()
            } else {
                None
            };
            let mut table = HashAggregator::new(&aggregates, spiller);
            for (key, group) in states.entries {
                table.add_states(key, group)?;
            }
            let groups: Vec<GroupEntry> = table
                .finish(global && step == AggregationStep::Final)?
                .into_iter()
                .collect();
            if step == AggregationStep::Intermediate {
                return Ok(Intermediate::States(PartialStates {
                    key_schema: states.key_schema,
                    entries: groups,
                }));
            }
            finalize_groups(states.key_schema, groups, calls).map(Intermediate::Rows)
        }
    }
}

fn finalize_groups(
    key_schema: Schema,
    groups: Vec<GroupEntry>,
    calls: &[AggregateCall],
) -> EngineResult<Table> {
    let mut schema = key_schema;
    schema.extend(
        calls
            .iter()
            .map(|c| (c.output.clone(), c.result_type.clone())),
    );
    let rows = groups
        .into_iter()
        .map(|(mut key, states)| {
            for (state, call) in states.iter().zip(calls) {
                key.push(state.finalize(call)?);
            }
            Ok(key)
        })
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(Table { schema, rows })
}

/// Aggregates runs of equal consecutive keys.
fn streaming_aggregate(
    rows: &[Vec<Value>],
    aggregates: &[BoundAggregate<'_>],
    key_of: impl Fn(&[Value]) -> Vec<Value>,
    global: bool,
) -> EngineResult<Vec<GroupEntry>> {
    let mut groups: Vec<GroupEntry> = Vec::new();
    for row in rows {
        let key = key_of(row);
        match groups.last_mut() {
            Some((current, states)) if *current == key => add_row(states, aggregates, row)?,
            _ => {
                let mut states = new_states(aggregates)?;
                add_row(&mut states, aggregates, row)?;
                groups.push((key, states));
            }
        }
    }
    if groups.is_empty() && global {
        groups.push((Vec::new(), new_states(aggregates)?));
    }
    Ok(groups)
}

/// Writes sorted runs of JSON encoded data to the spill directory.
struct Spiller<'a> {
    dir: &'a Path,
    counter: &'a AtomicUsize,
    run_rows: usize,
    files: Vec<PathBuf>,
}

impl Spiller<'_> {
    fn write<T: Serialize>(&mut self, run: &T) -> EngineResult<()> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("spill_{id}.json"));
        let encoded = serde_json::to_vec(run)
            .map_err(|e| EngineError::Runtime(format!("failed to encode spill run: {e}")))?;
        fs::write(&path, encoded)
            .map_err(|e| EngineError::Runtime(format!("failed to write {}: {e}", path.display())))?;
        self.files.push(path);
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(path: &Path) -> EngineResult<T> {
        let bytes = fs::read(path)
            .map_err(|e| EngineError::Runtime(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Runtime(format!("corrupt spill file {}: {e}", path.display()))
        })
    }
}

struct HashAggregator<'a, 'b> {
    aggregates: &'a [BoundAggregate<'a>],
    groups: IndexMap<Vec<Value>, Vec<GroupState>>,
    spiller: Option<Spiller<'b>>,
}

impl<'a, 'b> HashAggregator<'a, 'b> {
    fn new(aggregates: &'a [BoundAggregate<'a>], spiller: Option<Spiller<'b>>) -> Self {
        Self {
            aggregates,
            groups: IndexMap::new(),
            spiller,
        }
    }

    fn group(&mut self, key: Vec<Value>) -> EngineResult<&mut Vec<GroupState>> {
        Ok(match self.groups.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(new_states(self.aggregates)?),
        })
    }

    fn add_row(&mut self, key: Vec<Value>, row: &[Value]) -> EngineResult<()> {
        let aggregates = self.aggregates;
        add_row(self.group(key)?, aggregates, row)?;
        self.maybe_spill()
    }

    fn add_states(&mut self, key: Vec<Value>, states: Vec<GroupState>) -> EngineResult<()> {
        merge_states(self.group(key)?, states)?;
        self.maybe_spill()
    }

    fn maybe_spill(&mut self) -> EngineResult<()> {
        let Some(spiller) = self.spiller.as_mut() else {
            return Ok(());
        };
        if self.groups.len() < spiller.run_rows {
            return Ok(());
        }
        let run: Vec<GroupEntry> = std::mem::take(&mut self.groups).into_iter().collect();
        spiller.write(&run)
    }

    /// Merges spilled runs back in. For global aggregations an empty input
    /// still yields one group.
    fn finish(mut self, global: bool) -> EngineResult<IndexMap<Vec<Value>, Vec<GroupState>>> {
        if let Some(spiller) = self.spiller.take() {
            let in_memory = std::mem::take(&mut self.groups);
            for path in &spiller.files {
                let run: Vec<GroupEntry> = Spiller::read(path)?;
                for (key, states) in run {
                    merge_states(self.group(key)?, states)?;
                }
            }
            for (key, states) in in_memory {
                merge_states(self.group(key)?, states)?;
            }
        }
        if global && self.groups.is_empty() {
            self.groups.insert(Vec::new(), new_states(self.aggregates)?);
        }
        Ok(self.groups)
    }
}

/// External merge sort: sorted runs are spilled and merged back, ties going
/// to the earlier run so the sort stays stable.
fn sort_with_spill(
    rows: Vec<Vec<Value>>,
    keys: &BoundSortKeys,
    mut spiller: Spiller<'_>,
) -> EngineResult<Vec<Vec<Value>>> {
    let total = rows.len();
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let mut run: Vec<Vec<Value>> = rows.by_ref().take(spiller.run_rows).collect();
        run.sort_by(|a, b| compare_by_keys(a, b, keys));
        spiller.write(&run)?;
    }
    let mut runs = spiller
        .files
        .iter()
        .map(|path| Spiller::read::<VecDeque<Vec<Value>>>(path))
        .collect::<EngineResult<Vec<_>>>()?;
    let mut sorted = Vec::with_capacity(total);
    loop {
        let mut best: Option<usize> = None;
        for (i, run) in runs.iter().enumerate() {
            let Some(candidate) = run.front() else {
                continue;
            };
            let better = match best.and_then(|b| runs[b].front()) {
                None => true,
                Some(current) => compare_by_keys(candidate, current, keys).is_lt(),
            };
            if better {
                best = Some(i);
            }
        }
        let Some(row) = best.and_then(|b| runs[b].pop_front()) else {
            break;
        };
        sorted.push(row);
    }
    Ok(sorted)
}

// ------------------------------------------------------------------------
// Window
// ------------------------------------------------------------------------

fn bind_window_call(schema: &Schema, call: &WindowCall) -> EngineResult<BoundWindowCall> {
    let offset_column = |offset: Option<&FrameOffset>| -> EngineResult<Option<usize>> {
        match offset {
            Some(FrameOffset::Column(name)) => Ok(Some(column_index(schema, name)?)),
            _ => Ok(None),
        }
    };
    Ok(BoundWindowCall {
        call: call.clone(),
        args: call
            .args
            .iter()
            .map(|a| column_index(schema, a))
            .collect::<EngineResult<Vec<_>>>()?,
        start_offset: offset_column(call.frame.start.offset())?,
        end_offset: offset_column(call.frame.end.offset())?,
    })
}

fn window(
    table: Table,
    partition_keys: &[String],
    sorting_keys: &[SortKey],
    functions: &[WindowCall],
    inputs_sorted: bool,
    ctx: &Context<'_>,
) -> EngineResult<Table> {
    let key_indices = partition_keys
        .iter()
        .map(|k| table.index_of(k))
        .collect::<EngineResult<Vec<_>>>()?;
    let sort_keys = bind_sort_keys(&table.schema, sorting_keys)?;
    let calls = functions
        .iter()
        .map(|f| bind_window_call(&table.schema, f))
        .collect::<EngineResult<Vec<_>>>()?;

    let mut partitions: IndexMap<Vec<Value>, Vec<Vec<Value>>> = IndexMap::new();
    for row in table.rows {
        let key: Vec<Value> = key_indices.iter().map(|&i| row[i].clone()).collect();
        partitions.entry(key).or_default().push(row);
    }

    // Round-robin partitions over drivers, then restore partition order.
    let num_partitions = partitions.len();
    let num_drivers = ctx.max_drivers.min(num_partitions).max(1);
    let mut shards: Vec<Vec<(usize, Vec<Vec<Value>>)>> = vec![Vec::new(); num_drivers];
    for (index, (_, rows)) in partitions.into_iter().enumerate() {
        shards[index % num_drivers].push((index, rows));
    }
    let results = run_drivers(shards, |shard| -> EngineResult<Vec<(usize, Vec<Vec<Value>>)>> {
        shard
            .into_iter()
            .map(|(index, mut rows)| {
                if !inputs_sorted {
                    rows.sort_by(|a, b| compare_by_keys(a, b, &sort_keys));
                }
                let outputs = calls
                    .iter()
                    .map(|call| evaluate_partition(&rows, call, &sort_keys))
                    .collect::<EngineResult<Vec<_>>>()?;
                for (i, row) in rows.iter_mut().enumerate() {
                    row.extend(outputs.iter().map(|values| values[i].clone()));
                }
                Ok((index, rows))
            })
            .collect()
    });

    let mut ordered: Vec<Option<Vec<Vec<Value>>>> = vec![None; num_partitions];
    for result in results {
        for (index, rows) in result? {
            ordered[index] = Some(rows);
        }
    }
    let mut schema = table.schema;
    schema.extend(
        functions
            .iter()
            .map(|f| (f.output.clone(), f.result_type.clone())),
    );
    Ok(Table {
        schema,
        rows: ordered.into_iter().flatten().flatten().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::plan::{Frame, FrameBound, FrameKind};

    fn input() -> Vec<RowBatch> {
        let batch = |offset: i64| {
            RowBatch::try_new(vec![
                Column::new(
                    "c0",
                    DataType::BigInt,
                    (0..50)
                        .map(|i| {
                            if i % 9 == 0 {
                                Value::Null
                            } else {
                                Value::Int(i + offset)
                            }
                        })
                        .collect(),
                ),
                Column::new(
                    "g0",
                    DataType::Integer,
                    (0..50).map(|i| Value::Int(i % 7)).collect(),
                ),
            ])
            .unwrap()
        };
        vec![batch(0), batch(100), batch(200)]
    }

    fn sum_call() -> AggregateCall {
        AggregateCall {
            function: "sum".to_string(),
            args: vec!["c0".to_string()],
            arg_types: vec![DataType::BigInt],
            result_type: DataType::BigInt,
            distinct: false,
            sorting_keys: Vec::new(),
            output: "a0".to_string(),
        }
    }

    fn sorted_rows(batch: &RowBatch) -> Vec<Vec<Value>> {
        let mut rows = batch.rows();
        rows.sort();
        rows
    }

    fn options(drivers: usize, spill: Option<&Path>, abandon: bool) -> ExecutionOptions {
        let mut configs = std::collections::HashMap::new();
        configs.insert(SPILL_RUN_ROWS_CONFIG.to_string(), "3".to_string());
        ExecutionOptions {
            inject_spill: spill.is_some(),
            spill_directory: spill.map(Path::to_path_buf),
            abandon_partial: abandon,
            max_drivers: drivers,
            configs,
        }
    }

    #[test]
    fn test_aggregation_shapes_agree() {
        let keys = vec!["g0".to_string()];
        let calls = vec![sum_call()];
        let values = PlanNode::values(input());
        let single = values
            .clone()
            .aggregation(AggregationStep::Single, &keys, &calls, false);
        let two_step = values
            .clone()
            .aggregation(AggregationStep::Partial, &keys, &calls, false)
            .aggregation(AggregationStep::Intermediate, &keys, &calls, false)
            .aggregation(AggregationStep::Final, &keys, &calls, false);
        let streaming = values
            .order_by(vec![SortKey::asc("g0")])
            .aggregation(AggregationStep::Single, &keys, &calls, true);

        let engine = LocalEngine::new();
        let spill_dir = tempfile::tempdir().unwrap();
        let expected = engine
            .execute(&single, &[], &options(1, None, false))
            .unwrap();
        assert_eq!(expected.num_rows(), 7);
        for plan in [&single, &two_step, &streaming] {
            for opts in [
                options(1, None, false),
                options(3, None, false),
                options(2, Some(spill_dir.path()), false),
                options(2, None, true),
            ] {
                let actual = engine.execute(plan, &[], &opts).unwrap();
                assert_eq!(sorted_rows(&actual), sorted_rows(&expected), "{plan}");
            }
        }
        assert!(std::fs::read_dir(spill_dir.path()).unwrap().count() > 0);
    }

    #[test]
    fn test_global_aggregation_on_empty_input() {
        let empty = RowBatch::empty(&[("c0".to_string(), DataType::BigInt)]);
        let plan = PlanNode::values(vec![empty])
            .aggregation(AggregationStep::Partial, &[], &[sum_call()], false)
            .aggregation(AggregationStep::Final, &[], &[sum_call()], false);
        let result = LocalEngine::new()
            .execute(&plan, &[], &options(2, None, false))
            .unwrap();
        assert_eq!(result.rows(), vec![vec![Value::Null]]);
    }

    #[test]
    fn test_partial_root_rejected() {
        let plan = PlanNode::values(input()).aggregation(
            AggregationStep::Partial,
            &[],
            &[sum_call()],
            false,
        );
        let err = LocalEngine::new()
            .execute(&plan, &[], &options(1, None, false))
            .unwrap_err();
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_spilled_sort_is_stable() {
        let plan = PlanNode::values(input()).order_by(vec![SortKey::asc("g0")]);
        let engine = LocalEngine::new();
        let expected = engine
            .execute(&plan, &[], &options(1, None, false))
            .unwrap();
        let spill_dir = tempfile::tempdir().unwrap();
        let actual = engine
            .execute(&plan, &[], &options(1, Some(spill_dir.path()), false))
            .unwrap();
        assert_eq!(actual.rows(), expected.rows());
    }

    #[test]
    fn test_window_drivers_agree() {
        let call = WindowCall {
            function: "sum".to_string(),
            args: vec!["c0".to_string()],
            arg_types: vec![DataType::BigInt],
            result_type: DataType::BigInt,
            frame: Frame {
                kind: FrameKind::Rows,
                start: FrameBound::UnboundedPreceding,
                end: FrameBound::CurrentRow,
            },
            output: "w0".to_string(),
        };
        let plan = PlanNode::values(input()).window(
            &["g0".to_string()],
            &[SortKey::asc("c0")],
            &[call],
            false,
        );
        let engine = LocalEngine::new();
        let one = engine
            .execute(&plan, &[], &options(1, None, false))
            .unwrap();
        let four = engine
            .execute(&plan, &[], &options(4, None, false))
            .unwrap();
        assert_eq!(one.rows(), four.rows());
        assert_eq!(one.num_columns(), 3);
    }

    #[test]
    fn test_spill_without_directory() {
        let plan = PlanNode::values(input());
        let opts = ExecutionOptions {
            inject_spill: true,
            ..Default::default()
        };
        assert!(LocalEngine::new().execute(&plan, &[], &opts).is_err());
    }
}
