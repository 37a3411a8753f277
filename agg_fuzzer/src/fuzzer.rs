//! The fuzz loop.
//!
//! Every iteration picks a signature, synthesizes input for it, builds a set
//! of equivalent plans, runs them all and checks that they agree with each
//! other and, where possible, with the reference database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::RngCore;
use tracing::instrument;

use crate::batch::{make_names, RowBatch};
use crate::catalog::{FunctionRegistry, SignatureCatalog};
use crate::comparator::{Comparator, CompareMode, ComparisonResult};
use crate::engine::{LocalEngine, QueryEngine};
use crate::error::{FuzzerError, Result};
use crate::executor::{Executor, Outcome};
use crate::functions::{builtin_input_generators, builtin_registry, builtin_verifiers};
use crate::input::{InputGenerators, InputSynthesizer, SynthesizerConfig, ROW_NUMBER_COLUMN};
use crate::memory::MemoryPool;
use crate::options::FuzzerOptions;
use crate::plan::{AggregateCall, Frame, FrameBound, FrameKind, FrameOffset, SortKey, WindowCall};
use crate::reference::{ReferenceQueryRunner, ReferenceResult, SqliteQueryRunner};
use crate::repro::{load_repro_info, persist_repro_info};
use crate::seed::SeedController;
use crate::selector::{SignatureSelector, SignatureSlot, SignatureStats};
use crate::signature::{CallableSignature, FunctionKind};
use crate::splits::SplitWriter;
use crate::stats::{print_functions_stats, FuzzerStats};
use crate::types::DataType;
use crate::variants::{PlanVariant, PlanVariantBuilder};
use crate::vector_fuzzer::{VectorFuzzer, VectorGenerator};
use crate::verifier::{ResultVerifier, VerificationContext};

/// Key types used when no reference runner narrows them down.
const DEFAULT_KEY_TYPES: [DataType; 7] = [
    DataType::Boolean,
    DataType::TinyInt,
    DataType::SmallInt,
    DataType::Integer,
    DataType::BigInt,
    DataType::Varchar,
    DataType::Varbinary,
];

/// RANGE frames with offsets need an integer sorting key.
const RANGE_KEY_TYPES: [DataType; 3] = [DataType::TinyInt, DataType::SmallInt, DataType::Integer];

const MAX_CONSTANT_FRAME_OFFSET: usize = 10;

/// Everything the fuzzer is wired to, apart from its options.
pub struct FuzzerSetup {
    pub registry: FunctionRegistry,
    pub engine: Arc<dyn QueryEngine>,
    pub reference: Option<Box<dyn ReferenceQueryRunner>>,
    pub verifiers: HashMap<String, Arc<dyn ResultVerifier>>,
    pub input_generators: InputGenerators,
    /// Defaults to a [`VectorFuzzer`] built from the options.
    pub vector_generator: Option<Box<dyn VectorGenerator>>,
}

impl FuzzerSetup {
    /// `engine` is fuzzed over the functions in `registry`, with no reference
    /// and no custom verifiers or generators.
    pub fn new(registry: FunctionRegistry, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            registry,
            engine,
            reference: None,
            verifiers: HashMap::new(),
            input_generators: HashMap::new(),
            vector_generator: None,
        }
    }

    /// The built-in functions on [`LocalEngine`], checked against SQLite.
    pub fn builtin() -> Self {
        Self {
            registry: builtin_registry(),
            engine: Arc::new(LocalEngine::new()),
            reference: Some(Box::new(SqliteQueryRunner::new())),
            verifiers: builtin_verifiers(),
            input_generators: builtin_input_generators(),
            vector_generator: None,
        }
    }

    pub fn with_reference(mut self, reference: Box<dyn ReferenceQueryRunner>) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// The function call under test.
#[derive(Debug, Clone)]
pub enum QueryKind {
    Aggregation {
        call: AggregateCall,
        keys_orderable: bool,
    },
    Window {
        call: WindowCall,
        sorting_keys: Vec<SortKey>,
        keys_orderable: bool,
    },
}

/// One synthesized query: its input and the call to evaluate over it.
#[derive(Debug, Clone)]
pub struct FuzzQuery {
    pub input: Vec<RowBatch>,
    /// Grouping keys for aggregations, partition keys for windows.
    pub keys: Vec<String>,
    pub custom_verification: bool,
    pub kind: QueryKind,
}

impl FuzzQuery {
    pub fn function(&self) -> &str {
        match &self.kind {
            QueryKind::Aggregation { call, .. } => &call.function,
            QueryKind::Window { call, .. } => &call.function,
        }
    }

    pub fn is_window(&self) -> bool {
        matches!(self.kind, QueryKind::Window { .. })
    }

    fn verification_context(&self) -> VerificationContext<'_> {
        let (args, output) = match &self.kind {
            QueryKind::Aggregation { call, .. } => (&call.args, &call.output),
            QueryKind::Window { call, .. } => (&call.args, &call.output),
        };
        VerificationContext {
            input: &self.input,
            keys: &self.keys,
            function: self.function(),
            args,
            output,
            window: self.is_window(),
        }
    }
}

/// An iteration that has been generated but not executed. The split files
/// the variants read live as long as this value.
pub struct PreparedIteration {
    pub signature: CallableSignature,
    pub slot: SignatureSlot,
    pub query: FuzzQuery,
    pub variants: Vec<PlanVariant>,
    _split_writer: SplitWriter,
}

pub struct AggregationFuzzer {
    options: FuzzerOptions,
    initial_seed: u64,
    seeds: SeedController,
    selector: SignatureSelector,
    synthesizer: InputSynthesizer,
    executor: Executor,
    reference: Option<Box<dyn ReferenceQueryRunner>>,
    verifiers: HashMap<String, Arc<dyn ResultVerifier>>,
    memory_pool: MemoryPool,
    split_pool: MemoryPool,
    stats: FuzzerStats,
}

impl AggregationFuzzer {
    /// Validates the setup before any iteration runs: an empty catalog, a
    /// generator for an unknown function or inconsistent options are
    /// configuration errors.
    pub fn new(options: FuzzerOptions, setup: FuzzerSetup) -> Result<Self> {
        use garde::Validate;
        options
            .validate()
            .map_err(|e| FuzzerError::InvalidOptions(e.to_string()))?;
        if options.persist_and_run_once && options.repro_persist_path.is_none() {
            return Err(FuzzerError::InvalidOptions(
                "persist_and_run_once requires repro_persist_path".to_string(),
            ));
        }

        let initial_seed = options.seed.unwrap_or_else(|| rand::rng().next_u64());
        let catalog = SignatureCatalog::from_registry(&setup.registry);
        let key_types: Vec<DataType> = match &setup.reference {
            Some(reference) => reference
                .supported_scalar_types()
                .into_iter()
                .filter(|ty| !ty.is_floating_point() && SignatureCatalog::is_supported_type(ty))
                .collect(),
            None => DEFAULT_KEY_TYPES.to_vec(),
        };

        let memory_pool = MemoryPool::root("agg_fuzzer", None);
        let leaf_pool = memory_pool.add_leaf_child("leaf")?;
        let split_pool = memory_pool
            .add_aggregate_child("writer")?
            .add_leaf_child("split_writer")?;

        let vector_generator = match setup.vector_generator {
            Some(generator) => generator,
            None => Box::new(VectorFuzzer::new(options.vector_fuzzer_options(), initial_seed)),
        };
        let synthesizer = InputSynthesizer::new(
            SynthesizerConfig {
                batch_size: options.batch_size,
                num_batches: options.num_batches,
                supported_key_types: key_types.clone(),
                orderable_group_keys: options.orderable_group_keys,
            },
            vector_generator,
            setup.input_generators,
            &catalog,
            leaf_pool,
        )?;
        let selector = SignatureSelector::new(catalog, key_types, options.max_num_varargs)?;
        let executor = Executor::new(setup.engine, options.query_configs.clone());

        let mut fuzzer = Self {
            options,
            initial_seed,
            seeds: SeedController::new(initial_seed),
            selector,
            synthesizer,
            executor,
            reference: setup.reference,
            verifiers: setup.verifiers,
            memory_pool,
            split_pool,
            stats: FuzzerStats::default(),
        };
        fuzzer.seed(initial_seed);
        Ok(fuzzer)
    }

    pub fn initial_seed(&self) -> u64 {
        self.initial_seed
    }

    pub fn stats(&self) -> &FuzzerStats {
        &self.stats
    }

    pub fn signature_stats(&self) -> &[SignatureStats] {
        self.selector.signature_stats()
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }

    /// Resets the master generator and derives the data generator's seed
    /// from it.
    fn seed(&mut self, seed: u64) {
        self.seeds.reseed(seed);
        let data_seed = self.seeds.next_seed();
        self.synthesizer.reseed(data_seed);
    }

    fn reseed(&mut self) {
        let seed = self.seeds.next_seed();
        self.seed(seed);
    }

    /// Runs until the stop condition holds. Returns [`FuzzerError::Defect`]
    /// on the first defect when `stop_on_failure` is set.
    pub fn run(&mut self) -> Result<FuzzerStats> {
        tracing::info!(
            "starting aggregation fuzzer with seed {} against engine {}",
            self.initial_seed,
            self.executor.engine_name()
        );
        print_functions_stats(&self.selector.catalog().functions_stats());

        let stop = self.options.stop_condition();
        let mut iteration = 0;
        let mut result = Ok(());
        while !stop.is_done(iteration) {
            let seed = self.seeds.current_seed();
            if let Err(e) = self.run_iteration(iteration, seed) {
                result = Err(e);
                break;
            }
            if self.options.persist_and_run_once {
                tracing::info!("persist_and_run_once is set, stopping after one iteration");
                break;
            }
            iteration += 1;
            self.reseed();
        }

        self.stats.print();
        if self.options.log_signature_stats {
            self.selector.print_signature_stats();
        }
        tracing::info!("peak memory usage: {} bytes", self.memory_pool.peak());
        result.map(|()| self.stats.clone())
    }

    #[instrument(skip(self))]
    fn run_iteration(&mut self, iteration: usize, seed: u64) -> Result<()> {
        tracing::info!(
            "==============================> Started iteration {iteration} (seed: {seed})"
        );
        let prepared = self.prepare_iteration()?;
        let defect = self.verify(&prepared);
        self.synthesizer.release_input()?;

        if defect.is_some() || self.options.persist_and_run_once {
            if let Some(path) = &self.options.repro_persist_path {
                persist_repro_info(
                    &prepared.variants,
                    path,
                    seed,
                    iteration,
                    prepared.query.custom_verification,
                )?;
            }
        }
        if let Some(reason) = defect {
            tracing::error!(
                "defect in {} at iteration {iteration} (seed {seed}): {reason}",
                prepared.signature
            );
            if self.options.stop_on_failure {
                return Err(FuzzerError::Defect {
                    iteration,
                    seed,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// SELECT, SYNTHESIZE and BUILD_VARIANTS for the current seed.
    pub fn prepare_iteration(&mut self) -> Result<PreparedIteration> {
        let (signature, slot) = self.selector.pick(self.seeds.rng())?;
        tracing::info!("testing {signature}");
        self.stats.num_iterations += 1;
        self.stats.function_names.insert(signature.name.clone());

        let window = signature.is_window_only()
            || (signature.metadata.kind == FunctionKind::Aggregate
                && self.seeds.rand_bool(self.options.window_probability));
        let query = if window {
            self.window_query(&signature)?
        } else {
            self.aggregation_query(&signature)?
        };

        let mut split_writer = SplitWriter::new(self.split_pool.clone())?;
        let splits = split_writer.write(&query.input)?;
        let builder = PlanVariantBuilder::new(splits, self.options.max_drivers);
        let shapes = match &query.kind {
            QueryKind::Aggregation {
                call,
                keys_orderable,
            } => builder.aggregation_shapes(&query.input, &query.keys, call, *keys_orderable),
            QueryKind::Window {
                call,
                sorting_keys,
                keys_orderable,
            } => builder.window_shapes(
                &query.input,
                &query.keys,
                sorting_keys,
                call,
                *keys_orderable,
            ),
        };
        let variants = builder.expand(shapes);
        Ok(PreparedIteration {
            signature,
            slot,
            query,
            variants,
            _split_writer: split_writer,
        })
    }

    fn aggregation_query(&mut self, signature: &CallableSignature) -> Result<FuzzQuery> {
        let metadata = signature.metadata;
        let mut names = make_names(signature.args.len());
        let mut types = signature.args.clone();

        let sorted = metadata.order_sensitive && self.seeds.rand_bool(0.5);
        let distinct = !sorted
            && metadata.supports_distinct
            && signature.args.len() == 1
            && self.seeds.rand_bool(0.2);
        let grouping_keys = if self.seeds.rand_bool(0.5) {
            Vec::new()
        } else {
            self.synthesizer.generate_keys("g", &mut names, &mut types)
        };
        let keys_orderable = orderable(&grouping_keys, &names, &types);

        let (input, sorting_keys) = if sorted {
            let columns =
                self.synthesizer
                    .generate_sorting_keys("s", &mut names, &mut types, false, &[], None);
            let mut sorting_keys: Vec<SortKey> =
                columns.iter().map(|c| self.random_sort_key(c)).collect();
            sorting_keys.push(SortKey::asc(ROW_NUMBER_COLUMN));
            let input = self.synthesizer.generate_input_data_with_row_number(
                &names,
                &types,
                &[],
                &[],
                &columns,
                Some(signature),
            )?;
            (input, sorting_keys)
        } else {
            let input = self
                .synthesizer
                .generate_input_data(&names, &types, Some(signature))?;
            (input, Vec::new())
        };

        if sorted {
            self.stats.num_sorted_inputs += 1;
        }
        if distinct {
            self.stats.num_distinct_inputs += 1;
        }

        // Sorted inputs end with the row number, so their order is total.
        let custom_verification = !metadata.deterministic || (metadata.order_sensitive && !sorted);
        let call = AggregateCall {
            function: signature.name.clone(),
            args: names[..signature.args.len()].to_vec(),
            arg_types: signature.args.clone(),
            result_type: signature.return_type.clone(),
            distinct,
            sorting_keys,
            output: "a0".to_string(),
        };
        tracing::debug!("aggregation: {call} grouped by {grouping_keys:?}");
        Ok(FuzzQuery {
            input,
            keys: grouping_keys,
            custom_verification,
            kind: QueryKind::Aggregation {
                call,
                keys_orderable,
            },
        })
    }

    fn window_query(&mut self, signature: &CallableSignature) -> Result<FuzzQuery> {
        let metadata = signature.metadata;
        let mut names = make_names(signature.args.len());
        let mut types = signature.args.clone();

        let partition_keys = if self.seeds.rand_bool(0.2) {
            Vec::new()
        } else {
            self.synthesizer.generate_keys("p", &mut names, &mut types)
        };
        let keys_orderable = orderable(&partition_keys, &names, &types);

        let kind = if self.seeds.rand_bool(0.5) {
            FrameKind::Rows
        } else {
            FrameKind::Range
        };
        let range = kind == FrameKind::Range;
        let scalar_types: &[DataType] = if range { &RANGE_KEY_TYPES } else { &[] };
        let columns = self.synthesizer.generate_sorting_keys(
            "s",
            &mut names,
            &mut types,
            range,
            scalar_types,
            None,
        );
        let mut sorting_keys: Vec<SortKey> =
            columns.iter().map(|c| self.random_sort_key(c)).collect();
        if !range {
            sorting_keys.push(SortKey::asc(ROW_NUMBER_COLUMN));
        }

        let mut bound_columns = Vec::new();
        let (start, start_kind) =
            self.frame_bound(0, 3, "k0", &mut names, &mut types, &mut bound_columns);
        let (end, _) = self.frame_bound(
            start_kind.max(1),
            4,
            "k1",
            &mut names,
            &mut types,
            &mut bound_columns,
        );
        let frame = Frame { kind, start, end };

        let input = self.synthesizer.generate_input_data_with_row_number(
            &names,
            &types,
            &partition_keys,
            &bound_columns,
            &columns,
            Some(signature),
        )?;
        self.stats.num_window_queries += 1;

        // ROWS frames order by the row number last, RANGE frames do not.
        let custom_verification = !metadata.deterministic || (metadata.order_sensitive && range);
        let call = WindowCall {
            function: signature.name.clone(),
            args: names[..signature.args.len()].to_vec(),
            arg_types: signature.args.clone(),
            result_type: signature.return_type.clone(),
            frame,
            output: "w0".to_string(),
        };
        tracing::debug!(
            "window: {call} partitioned by {partition_keys:?} ordered by {}",
            sorting_keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        Ok(FuzzQuery {
            input,
            keys: partition_keys,
            custom_verification,
            kind: QueryKind::Window {
                call,
                sorting_keys,
                keys_orderable,
            },
        })
    }

    fn random_sort_key(&mut self, column: &str) -> SortKey {
        SortKey {
            column: column.to_string(),
            ascending: self.seeds.rand_bool(0.5),
            nulls_first: self.seeds.rand_bool(0.5),
        }
    }

    /// Picks a bound of kind `min_kind..=max_kind`, in the order UNBOUNDED
    /// PRECEDING, PRECEDING, CURRENT ROW, FOLLOWING, UNBOUNDED FOLLOWING.
    /// Column offsets add an INTEGER column named `name`.
    fn frame_bound(
        &mut self,
        min_kind: usize,
        max_kind: usize,
        name: &str,
        names: &mut Vec<String>,
        types: &mut Vec<DataType>,
        bound_columns: &mut Vec<String>,
    ) -> (FrameBound, usize) {
        let kind = self.seeds.rand_int(min_kind, max_kind);
        let mut offset = || {
            if self.seeds.rand_bool(0.5) {
                FrameOffset::Constant(self.seeds.rand_int(0, MAX_CONSTANT_FRAME_OFFSET) as i64)
            } else {
                names.push(name.to_string());
                types.push(DataType::Integer);
                bound_columns.push(name.to_string());
                FrameOffset::Column(name.to_string())
            }
        };
        let bound = match kind {
            0 => FrameBound::UnboundedPreceding,
            1 => FrameBound::Preceding(offset()),
            2 => FrameBound::CurrentRow,
            3 => FrameBound::Following(offset()),
            _ => FrameBound::UnboundedFollowing,
        };
        (bound, kind)
    }

    fn execute(&self, variant: &PlanVariant) -> Outcome {
        let outcome = self.executor.execute(
            &variant.shape.plan,
            &variant.shape.splits,
            variant.inject_spill,
            variant.abandon_partial,
            variant.max_drivers,
        );
        match &outcome {
            Outcome::Success(batch) => {
                tracing::debug!("{variant} returned {} rows", batch.num_rows())
            }
            Outcome::Failure { message, fatal } => {
                tracing::debug!("{variant} failed (fatal={fatal}): {message}")
            }
        }
        outcome
    }

    /// EXECUTE, COMPARE and the stats half of RECORD. Returns the first
    /// defect found, if any.
    fn verify(&mut self, prepared: &PreparedIteration) -> Option<String> {
        let query = &prepared.query;
        let verifiers: Vec<Arc<dyn ResultVerifier>> = self
            .verifiers
            .get(query.function())
            .cloned()
            .into_iter()
            .collect();
        let mode = CompareMode {
            ordered: query_ordered(&prepared.variants),
            custom_verification: query.custom_verification,
            verifiers: &verifiers,
            context: Some(query.verification_context()),
        };

        let Some((baseline_variant, others)) = prepared.variants.split_first() else {
            return None;
        };
        let baseline = self.execute(baseline_variant);
        let mut failed = baseline.is_failure();
        let mut defect = fatal_failure(baseline_variant, &baseline);
        if defect.is_some() {
            self.stats.num_fatal_failures += 1;
        }

        if let Some(expected) = baseline.result() {
            if let Some(reason) = self.verify_with_reference(baseline_variant, expected, mode) {
                defect.get_or_insert(reason);
            }
        }

        for variant in others {
            let outcome = self.execute(variant);
            failed |= outcome.is_failure();
            if let Some(reason) = fatal_failure(variant, &outcome) {
                self.stats.num_fatal_failures += 1;
                defect.get_or_insert(reason);
                continue;
            }
            if let ComparisonResult::Mismatch { reason } =
                Comparator::compare(&outcome, &baseline, mode)
            {
                self.stats.num_mismatches += 1;
                tracing::error!("{variant} does not match {baseline_variant}: {reason}");
                defect.get_or_insert(format!("{variant} vs {baseline_variant}: {reason}"));
            }
        }

        if failed {
            self.stats.num_failed += 1;
            self.selector.record_failure(prepared.slot);
        }
        defect
    }

    fn verify_with_reference(
        &mut self,
        baseline_variant: &PlanVariant,
        expected: &RowBatch,
        mode: CompareMode<'_>,
    ) -> Option<String> {
        let reference = self.reference.as_ref()?;
        let result = reference.execute(&baseline_variant.shape.plan);
        self.stats.update_reference_query_stats(&result);
        let ReferenceResult::Rows(reference_rows) = result else {
            return None;
        };
        if mode.custom_verification && !mode.verifiers.iter().any(|v| v.supports_compare()) {
            self.stats.num_verification_skipped += 1;
            return None;
        }
        match Comparator::compare_batches(expected, &reference_rows, mode) {
            ComparisonResult::Match => {
                self.stats.num_verified += 1;
                None
            }
            ComparisonResult::Mismatch { reason } => {
                self.stats.num_mismatches += 1;
                tracing::error!(
                    "{baseline_variant} does not match {}: {reason}",
                    reference.name()
                );
                Some(format!("{baseline_variant} vs {}: {reason}", reference.name()))
            }
        }
    }
}

fn fatal_failure(variant: &PlanVariant, outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Failure {
            message,
            fatal: true,
        } => {
            tracing::error!("{variant} failed: {message}");
            Some(format!("{variant} failed: {message}"))
        }
        _ => None,
    }
}

/// Row order only matters when every variant ends in an ORDER BY.
fn query_ordered(variants: &[PlanVariant]) -> bool {
    !variants.is_empty() && variants.iter().all(|v| v.shape.plan.is_ordered())
}

fn orderable(keys: &[String], names: &[String], types: &[DataType]) -> bool {
    keys.iter().all(|key| {
        names
            .iter()
            .position(|name| name == key)
            .is_some_and(|i| types[i].is_orderable())
    })
}

/// Result of re-running a persisted case.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub num_variants: usize,
    /// `(variant, reason)` for every variant that diverged from the first.
    pub mismatches: Vec<(String, String)>,
}

impl ReplayReport {
    pub fn is_success(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-executes every plan persisted under `dir` and compares each one to the
/// first.
pub fn replay(
    dir: &Path,
    engine: Arc<dyn QueryEngine>,
    query_configs: HashMap<String, String>,
) -> Result<ReplayReport> {
    let cases = load_repro_info(dir)?;
    let executor = Executor::new(engine, query_configs);
    let mut report = ReplayReport {
        num_variants: cases.len(),
        ..Default::default()
    };
    let mut outcomes = cases.iter().map(|case| {
        let variant = &case.variant;
        let outcome = executor.execute(
            &variant.shape.plan,
            &variant.shape.splits,
            variant.inject_spill,
            variant.abandon_partial,
            variant.max_drivers,
        );
        (case, outcome)
    });
    let Some((first, baseline)) = outcomes.next() else {
        return Ok(report);
    };
    tracing::info!(
        "replaying {} plans of iteration {} (seed {})",
        cases.len(),
        first.iteration,
        first.seed
    );
    if let Some(reason) = fatal_failure(&first.variant, &baseline) {
        report.mismatches.push((first.variant.to_string(), reason));
    }
    let mode = CompareMode {
        ordered: first.variant.shape.plan.is_ordered(),
        custom_verification: first.custom_verification,
        ..Default::default()
    };
    for (case, outcome) in outcomes {
        let label = case.variant.to_string();
        if let Some(reason) = fatal_failure(&case.variant, &outcome) {
            report.mismatches.push((label, reason));
            continue;
        }
        if let ComparisonResult::Mismatch { reason } =
            Comparator::compare(&outcome, &baseline, mode)
        {
            tracing::error!("{label} does not match {}: {reason}", first.variant);
            report.mismatches.push((label, reason));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanNode;

    fn options(seed: u64) -> FuzzerOptions {
        FuzzerOptions {
            seed: Some(seed),
            steps: 5,
            ..FuzzerOptions::quick()
        }
    }

    #[test]
    fn test_rejects_invalid_options() {
        let options = FuzzerOptions {
            null_ratio: 2.0,
            ..options(1)
        };
        let setup = FuzzerSetup::new(builtin_registry(), Arc::new(LocalEngine::new()));
        assert!(matches!(
            AggregationFuzzer::new(options, setup),
            Err(FuzzerError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_persist_and_run_once_needs_repro_path() {
        let options = FuzzerOptions {
            persist_and_run_once: true,
            repro_persist_path: None,
            ..options(1)
        };
        let setup = FuzzerSetup::new(builtin_registry(), Arc::new(LocalEngine::new()));
        assert!(matches!(
            AggregationFuzzer::new(options, setup),
            Err(FuzzerError::InvalidOptions(reason)) if reason.contains("repro_persist_path")
        ));
    }

    #[test]
    fn test_rejects_empty_registry() {
        let setup = FuzzerSetup::new(FunctionRegistry::new(), Arc::new(LocalEngine::new()));
        assert!(matches!(
            AggregationFuzzer::new(options(1), setup),
            Err(FuzzerError::EmptyCatalog)
        ));
    }

    #[test]
    fn test_prepared_iteration_is_consistent() {
        let setup = FuzzerSetup::new(builtin_registry(), Arc::new(LocalEngine::new()));
        let mut fuzzer = AggregationFuzzer::new(options(17), setup).unwrap();
        for _ in 0..20 {
            let prepared = fuzzer.prepare_iteration().unwrap();
            let baseline = &prepared.variants[0];
            assert!(!baseline.inject_spill && !baseline.abandon_partial);
            assert!(matches!(
                baseline.shape.plan.nodes().last(),
                Some(PlanNode::Values { .. })
            ));
            let num_rows: usize = prepared.query.input.iter().map(RowBatch::num_rows).sum();
            assert_eq!(num_rows, 20 * 3);
            if prepared.query.is_window() {
                assert!(prepared.query.input[0].column(ROW_NUMBER_COLUMN).is_some());
            }
            if !prepared.signature.metadata.deterministic {
                assert!(prepared.query.custom_verification);
            }
            fuzzer.synthesizer.release_input().unwrap();
            fuzzer.reseed();
        }
        assert_eq!(fuzzer.stats().num_iterations, 20);
    }

    #[test]
    fn test_window_only_functions_take_window_path() {
        let mut registry = FunctionRegistry::new();
        let row_number = builtin_registry()["row_number"].clone();
        registry.insert("row_number".to_string(), row_number);
        let setup = FuzzerSetup::new(registry, Arc::new(LocalEngine::new()));
        let mut fuzzer = AggregationFuzzer::new(options(3), setup).unwrap();
        let prepared = fuzzer.prepare_iteration().unwrap();
        assert!(prepared.query.is_window());
        assert!(prepared
            .variants
            .iter()
            .all(|v| !v.shape.plan.window_function_names().is_empty()));
    }

    #[test]
    fn test_run_local_engine_without_reference() {
        let setup = FuzzerSetup {
            verifiers: builtin_verifiers(),
            input_generators: builtin_input_generators(),
            ..FuzzerSetup::new(builtin_registry(), Arc::new(LocalEngine::new()))
        };
        let mut fuzzer = AggregationFuzzer::new(options(42), setup).unwrap();
        let stats = fuzzer.run().unwrap();
        assert_eq!(stats.num_iterations, 5);
        assert_eq!(stats.num_mismatches, 0);
        assert_eq!(fuzzer.memory_pool().used(), 0);
    }
}
