//! Query engines the fuzzer can drive.

pub mod accumulator;
pub mod local;
pub mod window;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::batch::RowBatch;
use crate::error::EngineError;
use crate::plan::PlanNode;
use crate::splits::Split;
use crate::types::Value;

pub use local::LocalEngine;

/// Physical knobs for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub inject_spill: bool,
    /// Scratch directory for spill files, set when `inject_spill` is.
    pub spill_directory: Option<PathBuf>,
    pub abandon_partial: bool,
    pub max_drivers: usize,
    /// Free-form engine configuration.
    pub configs: HashMap<String, String>,
}

/// Engine under test.
pub trait QueryEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Runs a plan to completion. Table scans read `splits`.
    fn execute(
        &self,
        plan: &PlanNode,
        splits: &[Split],
        options: &ExecutionOptions,
    ) -> Result<RowBatch, EngineError>;
}

/// Orders two rows by `(column, ascending, nulls_first)` keys.
pub fn compare_by_keys(a: &[Value], b: &[Value], keys: &[(usize, bool, bool)]) -> Ordering {
    for &(column, ascending, nulls_first) in keys {
        let ordering = match (&a[column], &b[column]) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => {
                if nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (_, Value::Null) => {
                if nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (x, y) => {
                if ascending {
                    x.cmp(y)
                } else {
                    y.cmp(x)
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
