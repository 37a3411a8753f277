//! Equivalent plan shapes for one function call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::batch::RowBatch;
use crate::plan::{AggregateCall, AggregationStep, PlanNode, SortKey, WindowCall};
use crate::splits::Split;

/// A plan and the split files its table scans read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWithSplits {
    pub label: String,
    pub plan: PlanNode,
    #[serde(default)]
    pub splits: Vec<Split>,
}

impl PlanWithSplits {
    fn new(label: &str, plan: PlanNode) -> Self {
        Self {
            label: label.to_string(),
            plan,
            splits: Vec::new(),
        }
    }

    fn with_splits(label: &str, plan: PlanNode, splits: &[Split]) -> Self {
        Self {
            label: label.to_string(),
            plan,
            splits: splits.to_vec(),
        }
    }
}

/// A plan shape plus the physical knobs to run it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanVariant {
    pub shape: PlanWithSplits,
    pub inject_spill: bool,
    pub abandon_partial: bool,
    pub max_drivers: usize,
}

impl fmt::Display for PlanVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (drivers={}", self.shape.label, self.max_drivers)?;
        if self.inject_spill {
            write!(f, ", spill")?;
        }
        if self.abandon_partial {
            write!(f, ", abandon partial")?;
        }
        write!(f, ")")
    }
}

/// Builds the plan shapes one iteration tests. The first shape is always
/// the baseline whose result the others must reproduce.
#[derive(Debug, Clone)]
pub struct PlanVariantBuilder {
    splits: Vec<Split>,
    max_drivers: usize,
}

impl PlanVariantBuilder {
    /// `splits` hold the same data as the VALUES input. Table scan shapes
    /// are skipped when there are none.
    pub fn new(splits: Vec<Split>, max_drivers: usize) -> Self {
        Self {
            splits,
            max_drivers: max_drivers.max(1),
        }
    }

    pub fn aggregation_shapes(
        &self,
        input: &[RowBatch],
        grouping_keys: &[String],
        call: &AggregateCall,
        keys_orderable: bool,
    ) -> Vec<PlanWithSplits> {
        let calls = std::slice::from_ref(call);
        let values = || PlanNode::values(input.to_vec());
        let single_step = call.distinct || !call.sorting_keys.is_empty();
        let schema = input.first().map(RowBatch::schema).unwrap_or_default();
        let scan = || PlanNode::table_scan(schema.clone());

        let mut shapes = vec![PlanWithSplits::new(
            "single",
            values().aggregation(AggregationStep::Single, grouping_keys, calls, false),
        )];
        if !single_step {
            shapes.push(PlanWithSplits::new(
                "partial-final",
                values()
                    .aggregation(AggregationStep::Partial, grouping_keys, calls, false)
                    .aggregation(AggregationStep::Final, grouping_keys, calls, false),
            ));
            shapes.push(PlanWithSplits::new(
                "partial-intermediate-final",
                values()
                    .aggregation(AggregationStep::Partial, grouping_keys, calls, false)
                    .aggregation(AggregationStep::Intermediate, grouping_keys, calls, false)
                    .aggregation(AggregationStep::Final, grouping_keys, calls, false),
            ));
        }
        if keys_orderable {
            let keys: Vec<SortKey> = grouping_keys.iter().map(SortKey::asc).collect();
            let source = if keys.is_empty() {
                values()
            } else {
                values().order_by(keys)
            };
            shapes.push(PlanWithSplits::new(
                "streaming",
                source.aggregation(AggregationStep::Single, grouping_keys, calls, true),
            ));
        }
        if !call.sorting_keys.is_empty() && keys_orderable {
            let mut keys: Vec<SortKey> = grouping_keys.iter().map(SortKey::asc).collect();
            keys.extend(call.sorting_keys.iter().cloned());
            shapes.push(PlanWithSplits::new(
                "sorted-input",
                values()
                    .order_by(keys)
                    .aggregation(AggregationStep::Single, grouping_keys, calls, false),
            ));
        }
        if !self.splits.is_empty() {
            let plan = if single_step {
                scan().aggregation(AggregationStep::Single, grouping_keys, calls, false)
            } else {
                scan()
                    .aggregation(AggregationStep::Partial, grouping_keys, calls, false)
                    .aggregation(AggregationStep::Final, grouping_keys, calls, false)
            };
            shapes.push(PlanWithSplits::with_splits("table-scan", plan, &self.splits));
        }
        shapes
    }

    pub fn window_shapes(
        &self,
        input: &[RowBatch],
        partition_keys: &[String],
        sorting_keys: &[SortKey],
        call: &WindowCall,
        keys_orderable: bool,
    ) -> Vec<PlanWithSplits> {
        let functions = std::slice::from_ref(call);
        let values = || PlanNode::values(input.to_vec());
        let mut shapes = vec![PlanWithSplits::new(
            "window",
            values().window(partition_keys, sorting_keys, functions, false),
        )];
        if keys_orderable {
            let mut keys: Vec<SortKey> = partition_keys.iter().map(SortKey::asc).collect();
            keys.extend(sorting_keys.iter().cloned());
            shapes.push(PlanWithSplits::new(
                "sorted-window",
                values()
                    .order_by(keys)
                    .window(partition_keys, sorting_keys, functions, true),
            ));
        }
        if !self.splits.is_empty() {
            let schema = input.first().map(RowBatch::schema).unwrap_or_default();
            shapes.push(PlanWithSplits::with_splits(
                "table-scan-window",
                PlanNode::table_scan(schema).window(partition_keys, sorting_keys, functions, false),
                &self.splits,
            ));
        }
        shapes
    }

    /// Attaches execution knobs: every shape runs with defaults and with
    /// spilling, the baseline also runs single-driver, and shapes with a
    /// partial step also run with partial aggregation abandoned.
    pub fn expand(&self, shapes: Vec<PlanWithSplits>) -> Vec<PlanVariant> {
        let mut variants = Vec::with_capacity(shapes.len() * 3);
        for (index, shape) in shapes.into_iter().enumerate() {
            let variant = |inject_spill, abandon_partial, max_drivers| PlanVariant {
                shape: shape.clone(),
                inject_spill,
                abandon_partial,
                max_drivers,
            };
            variants.push(variant(false, false, self.max_drivers));
            if index == 0 && self.max_drivers > 1 {
                variants.push(variant(false, false, 1));
            }
            variants.push(variant(true, false, self.max_drivers));
            if shape.plan.has_step(AggregationStep::Partial) {
                variants.push(variant(false, true, self.max_drivers));
            }
        }
        variants
    }
}
