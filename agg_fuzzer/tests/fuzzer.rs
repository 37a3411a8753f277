use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use agg_fuzzer::functions::{
    builtin_input_generators, builtin_registry, builtin_verifiers, BoundedIntegers,
};
use agg_fuzzer::input::InputGenerator;
use agg_fuzzer::repro::load_repro_info;
use agg_fuzzer::splits::Split;
use agg_fuzzer::{
    replay, AggregationFuzzer, DataType, EngineError, ExecutionOptions, FunctionRegistry,
    FuzzerError, FuzzerOptions, FuzzerSetup, LocalEngine, PlanNode, QueryEngine,
    ReferenceQueryRunner, ReferenceResult, RowBatch, SqliteQueryRunner,
};

fn options(seed: u64, steps: usize) -> FuzzerOptions {
    FuzzerOptions {
        seed: Some(seed),
        steps,
        ..FuzzerOptions::quick()
    }
}

fn setup(engine: Arc<dyn QueryEngine>) -> FuzzerSetup {
    FuzzerSetup {
        verifiers: builtin_verifiers(),
        input_generators: builtin_input_generators(),
        ..FuzzerSetup::new(builtin_registry(), engine)
    }
}

/// Loses the last output row whenever it is asked to spill.
struct DropRowOnSpill(LocalEngine);

impl QueryEngine for DropRowOnSpill {
    fn name(&self) -> &str {
        "drop_row_on_spill"
    }

    fn execute(
        &self,
        plan: &PlanNode,
        splits: &[Split],
        options: &ExecutionOptions,
    ) -> Result<RowBatch, EngineError> {
        let batch = self.0.execute(plan, splits, options)?;
        if !options.inject_spill {
            return Ok(batch);
        }
        let mut rows = batch.rows();
        rows.pop();
        RowBatch::from_rows(&batch.schema(), rows)
    }
}

struct PanicOnSpill(LocalEngine);

impl QueryEngine for PanicOnSpill {
    fn name(&self) -> &str {
        "panic_on_spill"
    }

    fn execute(
        &self,
        plan: &PlanNode,
        splits: &[Split],
        options: &ExecutionOptions,
    ) -> Result<RowBatch, EngineError> {
        if options.inject_spill {
            panic!("spill path is broken");
        }
        self.0.execute(plan, splits, options)
    }
}

/// Rejects every plan as bad input, like an overflowing sum would.
struct UserErrorEngine;

impl QueryEngine for UserErrorEngine {
    fn name(&self) -> &str {
        "user_error"
    }

    fn execute(
        &self,
        _plan: &PlanNode,
        _splits: &[Split],
        _options: &ExecutionOptions,
    ) -> Result<RowBatch, EngineError> {
        Err(EngineError::User("integer overflow".to_string()))
    }
}

/// Answers every query with the same canned result.
struct CannedReference(ReferenceResult);

impl ReferenceQueryRunner for CannedReference {
    fn name(&self) -> &str {
        "canned"
    }

    fn supported_scalar_types(&self) -> Vec<DataType> {
        vec![DataType::BigInt, DataType::Varchar]
    }

    fn execute(&self, _plan: &PlanNode) -> ReferenceResult {
        self.0.clone()
    }
}

fn registry_of(names: &[&str]) -> FunctionRegistry {
    let builtins = builtin_registry();
    names
        .iter()
        .map(|name| (name.to_string(), builtins[*name].clone()))
        .collect()
}

fn run_against(names: &[&str], reference: ReferenceResult) -> AggregationFuzzer {
    let setup = FuzzerSetup {
        verifiers: builtin_verifiers(),
        ..FuzzerSetup::new(registry_of(names), Arc::new(LocalEngine::new()))
    }
    .with_reference(Box::new(CannedReference(reference)));
    let mut fuzzer = AggregationFuzzer::new(options(31, 6), setup).unwrap();
    fuzzer.run().unwrap();
    fuzzer
}

/// `(iteration, seed, reason)` of a defect.
fn defect(err: FuzzerError) -> (usize, u64, String) {
    match err {
        FuzzerError::Defect {
            iteration,
            seed,
            reason,
        } => (iteration, seed, reason),
        other => panic!("expected a defect, got {other}"),
    }
}

fn persisted_cases(base: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(base)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_dir())
        .collect()
}

#[test]
fn test_same_seed_same_run() {
    let run = || {
        let mut fuzzer =
            AggregationFuzzer::new(options(1234, 8), setup(Arc::new(LocalEngine::new()))).unwrap();
        let stats = fuzzer.run().unwrap();
        (stats, fuzzer.signature_stats().to_vec())
    };
    let (stats_a, signatures_a) = run();
    let (stats_b, signatures_b) = run();
    assert_eq!(stats_a, stats_b);
    assert_eq!(signatures_a, signatures_b);
    assert_eq!(stats_a.num_iterations, 8);
    assert_eq!(
        signatures_a.iter().map(|s| s.num_runs).sum::<usize>(),
        stats_a.num_iterations
    );
}

#[test]
fn test_variants_agree_on_local_engine() {
    let mut fuzzer =
        AggregationFuzzer::new(options(7, 30), setup(Arc::new(LocalEngine::new()))).unwrap();
    let stats = fuzzer.run().unwrap();
    assert_eq!(stats.num_iterations, 30);
    assert_eq!(stats.num_defects(), 0);
}

#[test]
fn test_detects_mismatch() {
    let engine = Arc::new(DropRowOnSpill(LocalEngine::new()));
    let options = FuzzerOptions {
        stop_on_failure: true,
        ..options(99, 5)
    };
    let mut fuzzer = AggregationFuzzer::new(options, setup(engine)).unwrap();
    let err = fuzzer.run().unwrap_err();
    assert!(matches!(err, FuzzerError::Defect { .. }), "{err}");
    assert!(fuzzer.stats().num_mismatches > 0);
}

#[test]
fn test_keeps_going_by_default() {
    let engine = Arc::new(DropRowOnSpill(LocalEngine::new()));
    let mut fuzzer = AggregationFuzzer::new(options(99, 5), setup(engine)).unwrap();
    let stats = fuzzer.run().unwrap();
    assert_eq!(stats.num_iterations, 5);
    assert!(stats.num_mismatches > 0);
}

#[test]
fn test_captures_panics() {
    let engine = Arc::new(PanicOnSpill(LocalEngine::new()));
    let options = FuzzerOptions {
        stop_on_failure: true,
        ..options(5, 3)
    };
    let mut fuzzer = AggregationFuzzer::new(options, setup(engine)).unwrap();
    let (iteration, _, reason) = defect(fuzzer.run().unwrap_err());
    assert_eq!(iteration, 0);
    assert!(reason.contains("panicked"), "{reason}");
    assert_eq!(
        fuzzer.stats().num_fatal_failures,
        fuzzer.stats().num_defects()
    );
}

#[test]
fn test_persisted_failure_replays() {
    let base = tempfile::tempdir().unwrap();
    let engine = Arc::new(DropRowOnSpill(LocalEngine::new()));
    let options = FuzzerOptions {
        repro_persist_path: Some(base.path().to_path_buf()),
        stop_on_failure: true,
        ..options(99, 5)
    };
    let mut fuzzer = AggregationFuzzer::new(options, setup(engine.clone())).unwrap();
    let (iteration, seed, _) = defect(fuzzer.run().unwrap_err());

    let cases = persisted_cases(base.path());
    assert_eq!(cases.len(), 1);
    let dir = &cases[0];
    assert!(dir.ends_with(format!("aggregation_fuzzer_{iteration}_{seed}")));
    let loaded = load_repro_info(dir).unwrap();
    assert!(loaded
        .iter()
        .all(|case| case.seed == seed && case.iteration == iteration));
    assert!(loaded.iter().any(|case| case.variant.inject_spill));

    let report = replay(dir, engine, HashMap::new()).unwrap();
    assert_eq!(report.num_variants, loaded.len());
    assert!(!report.is_success());

    // The healthy engine agrees with itself on the same plans.
    let report = replay(dir, Arc::new(LocalEngine::new()), HashMap::new()).unwrap();
    assert!(report.is_success(), "{:?}", report.mismatches);
}

#[test]
fn test_persist_and_run_once() {
    let base = tempfile::tempdir().unwrap();
    let options = FuzzerOptions {
        repro_persist_path: Some(base.path().to_path_buf()),
        persist_and_run_once: true,
        ..options(11, 10)
    };
    let mut fuzzer =
        AggregationFuzzer::new(options, setup(Arc::new(LocalEngine::new()))).unwrap();
    let stats = fuzzer.run().unwrap();
    assert_eq!(stats.num_iterations, 1);
    let cases = persisted_cases(base.path());
    assert_eq!(cases.len(), 1);
    assert!(cases[0].ends_with("aggregation_fuzzer_0_11"));
    let report = replay(&cases[0], Arc::new(LocalEngine::new()), HashMap::new()).unwrap();
    assert!(report.is_success());
}

#[test]
fn test_user_errors_are_failures_not_defects() {
    let mut fuzzer =
        AggregationFuzzer::new(options(8, 4), setup(Arc::new(UserErrorEngine))).unwrap();
    let stats = fuzzer.run().unwrap();
    assert_eq!(stats.num_iterations, 4);
    assert_eq!(stats.num_failed, 4);
    assert_eq!(stats.num_defects(), 0);
    assert_eq!(
        fuzzer
            .signature_stats()
            .iter()
            .map(|s| s.num_failed)
            .sum::<usize>(),
        4
    );
}

#[test]
fn test_unsupported_reference_is_skipped() {
    let fuzzer = run_against(&["count"], ReferenceResult::Unsupported("no".to_string()));
    let stats = fuzzer.stats();
    assert_eq!(
        stats.num_reference_query_not_supported,
        stats.num_iterations
    );
    assert_eq!(stats.num_reference_query_failed, 0);
    assert_eq!(stats.num_verified, 0);
    assert_eq!(stats.num_defects(), 0);
}

#[test]
fn test_failed_reference_is_skipped() {
    let fuzzer = run_against(&["count"], ReferenceResult::Failed("locked".to_string()));
    let stats = fuzzer.stats();
    assert_eq!(stats.num_reference_query_failed, stats.num_iterations);
    assert_eq!(stats.num_reference_query_not_supported, 0);
    assert_eq!(stats.num_verified, 0);
    assert_eq!(stats.num_defects(), 0);
}

#[test]
fn test_reference_mismatch_is_a_defect() {
    let fuzzer = run_against(&["count"], ReferenceResult::Rows(RowBatch::empty(&[])));
    let stats = fuzzer.stats();
    assert_eq!(stats.num_iterations, 6);
    assert_eq!(stats.num_mismatches, stats.num_iterations);
    assert_eq!(stats.num_verified, 0);
    assert_eq!(stats.num_fatal_failures, 0);
}

#[test]
fn test_verify_only_functions_skip_reference_comparison() {
    let fuzzer = run_against(&["arbitrary"], ReferenceResult::Rows(RowBatch::empty(&[])));
    let stats = fuzzer.stats();
    assert_eq!(stats.num_iterations, 6);
    assert_eq!(stats.num_verification_skipped, stats.num_iterations);
    assert_eq!(stats.num_verified, 0);
    assert_eq!(stats.num_defects(), 0);
}

#[test]
fn test_unknown_input_generator_is_rejected() {
    let mut generators = builtin_input_generators();
    let bounded: Arc<dyn InputGenerator> = Arc::new(BoundedIntegers { max_abs: 10 });
    generators.insert("no_such_function".to_string(), bounded);
    let setup = FuzzerSetup {
        input_generators: generators,
        ..FuzzerSetup::new(builtin_registry(), Arc::new(LocalEngine::new()))
    };
    assert!(matches!(
        AggregationFuzzer::new(options(1, 1), setup),
        Err(FuzzerError::UnknownInputGenerator(name)) if name == "no_such_function"
    ));
}

#[test]
fn test_count_and_sum_match_sqlite() {
    let registry = registry_of(&["count", "sum"]);
    let mut generators = HashMap::new();
    let bounded: Arc<dyn InputGenerator> = Arc::new(BoundedIntegers {
        max_abs: 1_000_000_000,
    });
    generators.insert("sum".to_string(), bounded);
    let setup = FuzzerSetup {
        input_generators: generators,
        ..FuzzerSetup::new(registry, Arc::new(LocalEngine::new()))
    }
    .with_reference(Box::new(SqliteQueryRunner::new()));

    let mut fuzzer = AggregationFuzzer::new(options(2024, 20), setup).unwrap();
    let stats = fuzzer.run().unwrap();
    assert_eq!(stats.num_mismatches, 0);
    assert!(stats.num_verified > 0);
    assert!(stats
        .function_names
        .iter()
        .all(|name| name == "count" || name == "sum"));
}
