use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::Context;
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::engine::local::SPILL_RUN_ROWS_CONFIG;
use crate::vector_fuzzer::{TimestampPrecision, VectorFuzzerOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct FuzzerOptions {
    /// Initial seed. A random one is picked when unset.
    #[garde(skip)]
    pub seed: Option<u64>,
    /// Number of iterations, ignored when `duration_sec` is set.
    #[garde(skip)]
    pub steps: usize,
    #[garde(skip)]
    pub duration_sec: u64,
    #[garde(range(min = 1, max = 100_000))]
    pub batch_size: usize,
    #[garde(range(min = 1, max = 1_000))]
    pub num_batches: usize,
    #[garde(range(max = 64))]
    pub max_num_varargs: usize,
    #[garde(range(min = 0.0, max = 1.0))]
    pub null_ratio: f64,
    #[garde(range(min = 1, max = 100_000))]
    pub string_length: usize,
    #[garde(skip)]
    pub timestamp_precision: TimestampPrecision,
    /// Directory to persist reproduction cases of failed iterations into.
    #[garde(skip)]
    pub repro_persist_path: Option<PathBuf>,
    /// Persist the first iteration's plans and stop, e.g. to build a test
    /// case.
    #[garde(skip)]
    pub persist_and_run_once: bool,
    #[garde(skip)]
    pub log_signature_stats: bool,
    /// Abort on the first mismatch or engine crash instead of recording it
    /// and moving on.
    #[garde(skip)]
    pub stop_on_failure: bool,
    #[garde(range(min = 1, max = 64))]
    pub max_drivers: usize,
    /// Only generate grouping keys that can be sorted.
    #[garde(skip)]
    pub orderable_group_keys: bool,
    /// Chance that an aggregate runs as a window function instead.
    #[garde(range(min = 0.0, max = 1.0))]
    pub window_probability: f64,
    /// Passed through to the engine under test.
    #[garde(skip)]
    pub query_configs: HashMap<String, String>,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self {
            seed: None,
            steps: 10,
            duration_sec: 0,
            batch_size: 100,
            num_batches: 10,
            max_num_varargs: 5,
            null_ratio: 0.1,
            string_length: 4_000,
            timestamp_precision: TimestampPrecision::default(),
            repro_persist_path: None,
            persist_and_run_once: false,
            log_signature_stats: false,
            stop_on_failure: false,
            max_drivers: 2,
            orderable_group_keys: false,
            window_probability: 0.3,
            query_configs: HashMap::new(),
        }
    }
}

impl FuzzerOptions {
    /// Small inputs and many iterations, for smoke testing.
    pub fn quick() -> Self {
        let options = FuzzerOptions {
            steps: 50,
            batch_size: 20,
            num_batches: 3,
            max_num_varargs: 2,
            string_length: 16,
            ..Default::default()
        };
        debug_assert!(options.validate().is_ok());
        options
    }

    /// Tiny spill runs so that every spilling variant writes many files.
    pub fn spill_heavy() -> Self {
        let mut options = FuzzerOptions {
            batch_size: 200,
            num_batches: 5,
            string_length: 64,
            ..Default::default()
        };
        options
            .query_configs
            .insert(SPILL_RUN_ROWS_CONFIG.to_string(), "4".to_string());
        debug_assert!(options.validate().is_ok());
        options
    }

    pub fn parse_from_type(profile_type: ProfileType) -> anyhow::Result<Self> {
        let options = match profile_type {
            ProfileType::Default => Self::default(),
            ProfileType::Quick => Self::quick(),
            ProfileType::SpillHeavy => Self::spill_heavy(),
            ProfileType::Custom(path) => Self::parse(&path)
                .with_context(|| format!("failed to parse profile {}", path.display()))?,
        };
        Ok(options)
    }

    pub fn parse(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        // json5 allows comments and trailing commas
        let options: FuzzerOptions = json5::from_str(&contents)?;
        options.validate()?;
        Ok(options)
    }

    pub fn vector_fuzzer_options(&self) -> VectorFuzzerOptions {
        VectorFuzzerOptions {
            vector_size: self.batch_size,
            null_ratio: self.null_ratio,
            string_length: self.string_length,
            string_variable_length: true,
            timestamp_precision: self.timestamp_precision,
            ..Default::default()
        }
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition {
            start: Instant::now(),
            duration: (self.duration_sec > 0).then(|| Duration::from_secs(self.duration_sec)),
            steps: self.steps,
        }
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Serialize,
    Deserialize,
    EnumString,
    PartialEq,
    Eq,
    strum::Display,
    strum::VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive, serialize_all = "snake_case")]
pub enum ProfileType {
    #[default]
    Default,
    Quick,
    SpillHeavy,
    #[strum(disabled)]
    Custom(PathBuf),
}

impl ProfileType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if let Ok(profile) = ProfileType::from_str(s) {
            return Ok(profile);
        }
        let path = PathBuf::from(s);
        if path.exists() {
            Ok(ProfileType::Custom(path))
        } else {
            Err(anyhow::anyhow!("`{s}` is neither a predefined profile nor a profile file"))
        }
    }
}

/// Ends the run after `duration` if set, otherwise after `steps` iterations.
#[derive(Debug, Clone)]
pub struct StopCondition {
    start: Instant,
    duration: Option<Duration>,
    steps: usize,
}

impl StopCondition {
    pub fn is_done(&self, iteration: usize) -> bool {
        match self.duration {
            Some(duration) => self.start.elapsed() >= duration,
            None => iteration >= self.steps,
        }
    }
}
