//! Seeded differential fuzzer for aggregate and window functions.
//!
//! Each iteration draws a function signature from a [`SignatureCatalog`],
//! synthesizes input batches for it, and runs a family of logically
//! equivalent plans (single step, partial/final, streaming, spilling, table
//! scans, ...) against the engine under test. Results must agree with each
//! other and with a reference database. Failing iterations can be persisted
//! and replayed.

pub mod batch;
pub mod catalog;
pub mod comparator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod functions;
pub mod fuzzer;
pub mod input;
pub mod memory;
pub mod options;
pub mod plan;
pub mod reference;
pub mod repro;
pub mod seed;
pub mod selector;
pub mod signature;
pub mod splits;
pub mod stats;
pub mod types;
pub mod variants;
pub mod vector_fuzzer;
pub mod verifier;

pub use batch::{Column, RowBatch};
pub use catalog::{FunctionEntry, FunctionRegistry, SignatureCatalog};
pub use comparator::{Comparator, ComparisonResult};
pub use engine::{ExecutionOptions, LocalEngine, QueryEngine};
pub use error::{EngineError, FuzzerError, Result};
pub use executor::{Executor, Outcome};
pub use fuzzer::{replay, AggregationFuzzer, FuzzerSetup, ReplayReport};
pub use options::{FuzzerOptions, ProfileType};
pub use plan::PlanNode;
pub use reference::{ReferenceQueryRunner, ReferenceResult, SqliteQueryRunner};
pub use stats::FuzzerStats;
pub use types::{DataType, Value};
