//! Runs plans against the engine under test and captures every failure.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::batch::RowBatch;
use crate::engine::{ExecutionOptions, QueryEngine};
use crate::error::EngineError;
use crate::plan::PlanNode;
use crate::splits::Split;

/// Result of one plan execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(RowBatch),
    /// `fatal` is set for engine defects: runtime errors and panics. User
    /// errors such as integer overflow are expected for some inputs.
    Failure { message: String, fatal: bool },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Failure { fatal: true, .. })
    }

    pub fn result(&self) -> Option<&RowBatch> {
        match self {
            Outcome::Success(batch) => Some(batch),
            Outcome::Failure { .. } => None,
        }
    }
}

impl From<Result<RowBatch, EngineError>> for Outcome {
    fn from(result: Result<RowBatch, EngineError>) -> Self {
        match result {
            Ok(batch) => Outcome::Success(batch),
            Err(e) => Outcome::Failure {
                fatal: !e.is_user_error(),
                message: e.to_string(),
            },
        }
    }
}

pub struct Executor {
    engine: Arc<dyn QueryEngine>,
    query_configs: HashMap<String, String>,
}

impl Executor {
    pub fn new(engine: Arc<dyn QueryEngine>, query_configs: HashMap<String, String>) -> Self {
        Self {
            engine,
            query_configs,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Runs `plan` once. Never returns an error: engine errors and panics
    /// end up in [`Outcome::Failure`].
    pub fn execute(
        &self,
        plan: &PlanNode,
        splits: &[Split],
        inject_spill: bool,
        abandon_partial: bool,
        max_drivers: usize,
    ) -> Outcome {
        tracing::debug!(
            "plan (spill={inject_spill}, abandon={abandon_partial}, drivers={max_drivers}):\n{plan}"
        );
        let spill_directory = if inject_spill {
            match tempfile::Builder::new().prefix("agg_spill").tempdir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    return Outcome::Failure {
                        message: format!("failed to create spill directory: {e}"),
                        fatal: true,
                    }
                }
            }
        } else {
            None
        };
        let options = ExecutionOptions {
            inject_spill,
            spill_directory: spill_directory.as_ref().map(|dir| dir.path().to_path_buf()),
            abandon_partial,
            max_drivers,
            configs: self.query_configs.clone(),
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            self.engine.execute(plan, splits, &options)
        })) {
            Ok(result) => Outcome::from(result),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::Failure {
                    message: format!("engine panicked: {reason}"),
                    fatal: true,
                }
            }
        };
        match &outcome {
            Outcome::Success(batch) => tracing::debug!("{} rows", batch.num_rows()),
            Outcome::Failure { message, fatal } => {
                tracing::debug!("execution failed (fatal={fatal}): {message}")
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::engine::LocalEngine;
    use crate::types::{DataType, Value};

    struct Panicking;

    impl QueryEngine for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn execute(
            &self,
            _plan: &PlanNode,
            _splits: &[Split],
            _options: &ExecutionOptions,
        ) -> Result<RowBatch, EngineError> {
            panic!("boom");
        }
    }

    fn values() -> PlanNode {
        PlanNode::values(vec![RowBatch::try_new(vec![Column::new(
            "c0",
            DataType::BigInt,
            vec![Value::Int(1), Value::Null],
        )])
        .unwrap()])
    }

    #[test]
    fn test_success() {
        let executor = Executor::new(Arc::new(LocalEngine::new()), HashMap::new());
        let outcome = executor.execute(&values(), &[], true, false, 2);
        assert_eq!(outcome.result().map(RowBatch::num_rows), Some(2));
    }

    #[test]
    fn test_panic_is_fatal_failure() {
        let executor = Executor::new(Arc::new(Panicking), HashMap::new());
        let outcome = executor.execute(&values(), &[], false, false, 1);
        match outcome {
            Outcome::Failure { message, fatal } => {
                assert!(fatal);
                assert!(message.contains("boom"), "{message}");
            }
            Outcome::Success(_) => panic!("expected a failure"),
        }
    }

    #[test]
    fn test_user_error_is_not_fatal() {
        let outcome = Outcome::from(Err(EngineError::User("integer overflow".to_string())));
        assert!(outcome.is_failure());
        assert!(!outcome.is_fatal());
    }
}
