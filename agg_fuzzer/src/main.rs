//! Differential fuzzer for aggregate and window functions.
//!
//! Runs the built-in functions on the local engine and checks them against
//! SQLite, or replays a persisted failure.

use std::path::PathBuf;
use std::sync::Arc;

use agg_fuzzer::vector_fuzzer::TimestampPrecision;
use agg_fuzzer::{
    replay, AggregationFuzzer, FuzzerError, FuzzerOptions, FuzzerSetup, LocalEngine, ProfileType,
};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Initial seed. Overrides the profile's seed; random when neither is set.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Predefined profile (default, quick, spill_heavy) or path to a JSON5
    /// profile.
    #[arg(short, long, default_value = "default", value_parser = ProfileType::parse)]
    profile: ProfileType,

    /// Number of iterations.
    #[arg(short = 'n', long)]
    steps: Option<usize>,

    /// Run for this many seconds instead of a fixed number of iterations.
    #[arg(short, long)]
    duration_sec: Option<u64>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_batches: Option<usize>,

    /// Share of generated values that are NULL, between 0 and 1.
    #[arg(long)]
    null_ratio: Option<f64>,

    /// Upper bound on extra arguments passed to variadic functions.
    #[arg(long)]
    max_num_varargs: Option<usize>,

    #[arg(long)]
    max_drivers: Option<usize>,

    #[arg(long, value_enum)]
    timestamp_precision: Option<TimestampPrecision>,

    /// Directory to persist failing iterations into.
    #[arg(long)]
    repro_persist_path: Option<PathBuf>,

    /// Persist the plans of the first iteration and stop.
    #[arg(long)]
    persist_and_run_once: bool,

    /// Log signatures that failed in at least half of their runs.
    #[arg(long)]
    log_signature_stats: bool,

    /// Stop at the first mismatch or engine crash.
    #[arg(long)]
    stop_on_failure: bool,

    /// Do not check results against SQLite.
    #[arg(long)]
    no_reference: bool,

    /// Re-run a persisted case instead of fuzzing.
    #[arg(long, conflicts_with_all = ["steps", "duration_sec", "persist_and_run_once"])]
    replay: Option<PathBuf>,
}

impl Args {
    fn options(&self) -> Result<FuzzerOptions> {
        let mut options = FuzzerOptions::parse_from_type(self.profile.clone())?;
        if let Some(seed) = self.seed {
            options.seed = Some(seed);
        }
        if let Some(steps) = self.steps {
            options.steps = steps;
        }
        if let Some(duration_sec) = self.duration_sec {
            options.duration_sec = duration_sec;
        }
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(num_batches) = self.num_batches {
            options.num_batches = num_batches;
        }
        if let Some(null_ratio) = self.null_ratio {
            options.null_ratio = null_ratio;
        }
        if let Some(max_num_varargs) = self.max_num_varargs {
            options.max_num_varargs = max_num_varargs;
        }
        if let Some(max_drivers) = self.max_drivers {
            options.max_drivers = max_drivers;
        }
        if let Some(precision) = self.timestamp_precision {
            options.timestamp_precision = precision;
        }
        if self.repro_persist_path.is_some() {
            options.repro_persist_path = self.repro_persist_path.clone();
        }
        options.persist_and_run_once |= self.persist_and_run_once;
        options.log_signature_stats |= self.log_signature_stats;
        options.stop_on_failure |= self.stop_on_failure;
        Ok(options)
    }
}

fn init_logger() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_line_number(true)
                .without_time()
                .with_thread_ids(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();
    let options = args.options().context("failed to load fuzzer options")?;

    if let Some(dir) = &args.replay {
        let report = replay(dir, Arc::new(LocalEngine::new()), options.query_configs)
            .with_context(|| format!("failed to replay {}", dir.display()))?;
        if !report.is_success() {
            for (variant, reason) in &report.mismatches {
                tracing::error!("{variant}: {reason}");
            }
            std::process::exit(1);
        }
        tracing::info!("all {} plans agree", report.num_variants);
        return Ok(());
    }

    let mut setup = FuzzerSetup::builtin();
    if args.no_reference {
        setup.reference = None;
    }
    let mut fuzzer =
        AggregationFuzzer::new(options, setup).context("failed to set up the fuzzer")?;
    match fuzzer.run() {
        Ok(stats) if stats.num_defects() > 0 => {
            tracing::error!(
                "{} mismatches and {} engine crashes found, rerun with --seed {}",
                stats.num_mismatches,
                stats.num_fatal_failures,
                fuzzer.initial_seed()
            );
            std::process::exit(1);
        }
        Ok(_) => Ok(()),
        Err(e @ FuzzerError::Defect { .. }) => {
            tracing::error!("{e}, rerun with --seed {}", fuzzer.initial_seed());
            std::process::exit(1);
        }
        Err(e) => Err(e).context("fuzzer run failed"),
    }
}
