//! Seeded random column generation.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::types::{DataType, Value};

/// Sub-second precision of generated timestamps.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimestampPrecision {
    #[default]
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorFuzzerOptions {
    /// Number of values per generated vector.
    pub vector_size: usize,
    pub null_ratio: f64,
    /// Maximum string length, or the exact length when not variable.
    pub string_length: usize,
    pub string_variable_length: bool,
    pub container_length: usize,
    pub timestamp_precision: TimestampPrecision,
}

impl Default for VectorFuzzerOptions {
    fn default() -> Self {
        Self {
            vector_size: 100,
            null_ratio: 0.1,
            string_length: 4000,
            string_variable_length: true,
            container_length: 10,
            timestamp_precision: TimestampPrecision::Milliseconds,
        }
    }
}

/// Source of random column data.
pub trait VectorGenerator: Send {
    fn options(&self) -> &VectorFuzzerOptions;

    fn reseed(&mut self, seed: u64);

    /// Generates `vector_size` values, each null with probability `null_ratio`.
    fn fuzz(&mut self, ty: &DataType) -> Vec<Value>;

    /// Generates `vector_size` non-null values.
    fn fuzz_not_null(&mut self, ty: &DataType) -> Vec<Value>;
}

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 _-";
const MIN_TIMESTAMP_SECONDS: i64 = -2_208_988_800;
const MAX_TIMESTAMP_SECONDS: i64 = 4_102_444_800;
const MAX_INTERVAL: i64 = 1_000_000_000_000;

/// Default [`VectorGenerator`], backed by its own ChaCha8 stream.
#[derive(Debug, Clone)]
pub struct VectorFuzzer {
    options: VectorFuzzerOptions,
    rng: ChaCha8Rng,
}

impl VectorFuzzer {
    pub fn new(options: VectorFuzzerOptions, seed: u64) -> Self {
        Self {
            options,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn random_value(&mut self, ty: &DataType, allow_null: bool) -> Value {
        let null_ratio = self.options.null_ratio.clamp(0.0, 1.0);
        if allow_null && self.rng.random_bool(null_ratio) {
            return Value::Null;
        }
        match ty {
            DataType::Boolean => Value::Boolean(self.rng.random_bool(0.5)),
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt => {
                Value::Int(self.random_integer(ty))
            }
            DataType::Real => Value::Double(self.rng.random_range(-1e4f32..1e4f32) as f64),
            DataType::Double => Value::Double(self.random_double()),
            DataType::Varchar => Value::Varchar(self.random_string()),
            DataType::Varbinary => {
                let len = self.random_length();
                Value::Varbinary((0..len).map(|_| self.rng.random()).collect())
            }
            DataType::Timestamp => self.random_timestamp(),
            DataType::Date => Value::Date(self.rng.random_range(-100_000..=100_000)),
            DataType::IntervalDayTime => {
                Value::Interval(self.rng.random_range(-MAX_INTERVAL..=MAX_INTERVAL))
            }
            DataType::Unknown => Value::Null,
            DataType::Array(element) => {
                let len = self.rng.random_range(0..=self.options.container_length);
                Value::Array((0..len).map(|_| self.random_value(element, true)).collect())
            }
            DataType::Map(key, value) => {
                let len = self.rng.random_range(0..=self.options.container_length);
                let mut seen = HashSet::new();
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.random_value(key, false);
                    if seen.insert(k.clone()) {
                        let v = self.random_value(value, true);
                        entries.push((k, v));
                    }
                }
                Value::Map(entries)
            }
            DataType::Row(fields) => {
                Value::Row(fields.iter().map(|f| self.random_value(f, true)).collect())
            }
        }
    }

    /// Mostly small values so that keys collide, with the occasional
    /// boundary or full-range value.
    fn random_integer(&mut self, ty: &DataType) -> i64 {
        let (min, max) = ty.integer_bounds().unwrap_or((i64::MIN, i64::MAX));
        match self.rng.random_range(0..10) {
            0 => {
                if self.rng.random_bool(0.5) {
                    min
                } else {
                    max
                }
            }
            1 | 2 => self.rng.random_range(min..=max),
            _ => self.rng.random_range(-1000i64..=1000).clamp(min, max),
        }
    }

    /// Multiples of 1/8 sum exactly regardless of order; the rest exercise
    /// rounding.
    fn random_double(&mut self) -> f64 {
        if self.rng.random_bool(0.8) {
            self.rng.random_range(-800_000i64..=800_000) as f64 / 8.0
        } else {
            self.rng.random_range(-1e3..1e3)
        }
    }

    fn random_length(&mut self) -> usize {
        if self.options.string_variable_length {
            self.rng.random_range(0..=self.options.string_length)
        } else {
            self.options.string_length
        }
    }

    fn random_string(&mut self) -> String {
        // Short strings from a tiny alphabet collide often enough to form
        // groups.
        if self.rng.random_bool(0.3) {
            let len = self.rng.random_range(0..=2);
            return (0..len)
                .map(|_| if self.rng.random_bool(0.5) { 'a' } else { 'b' })
                .collect();
        }
        let len = self.random_length();
        (0..len)
            .map(|_| ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }

    fn random_timestamp(&mut self) -> Value {
        let seconds = self
            .rng
            .random_range(MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS);
        let nanos = match self.options.timestamp_precision {
            TimestampPrecision::Milliseconds => self.rng.random_range(0..1_000u32) * 1_000_000,
            TimestampPrecision::Microseconds => self.rng.random_range(0..1_000_000u32) * 1_000,
            TimestampPrecision::Nanoseconds => self.rng.random_range(0..1_000_000_000u32),
        };
        Value::Timestamp { seconds, nanos }
    }
}

impl VectorGenerator for VectorFuzzer {
    fn options(&self) -> &VectorFuzzerOptions {
        &self.options
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    fn fuzz(&mut self, ty: &DataType) -> Vec<Value> {
        (0..self.options.vector_size)
            .map(|_| self.random_value(ty, true))
            .collect()
    }

    fn fuzz_not_null(&mut self, ty: &DataType) -> Vec<Value> {
        (0..self.options.vector_size)
            .map(|_| self.random_value(ty, false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(null_ratio: f64) -> VectorFuzzerOptions {
        VectorFuzzerOptions {
            vector_size: 200,
            null_ratio,
            string_length: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_seed_same_data() {
        let mut a = VectorFuzzer::new(options(0.2), 99);
        let mut b = VectorFuzzer::new(options(0.2), 99);
        for ty in [DataType::BigInt, DataType::Varchar, DataType::array(DataType::Double)] {
            assert_eq!(a.fuzz(&ty), b.fuzz(&ty));
        }
    }

    #[test]
    fn test_integer_bounds_respected() {
        let mut fuzzer = VectorFuzzer::new(options(0.0), 5);
        for value in fuzzer.fuzz(&DataType::TinyInt) {
            let v = value.as_int().unwrap();
            assert!((i8::MIN as i64..=i8::MAX as i64).contains(&v));
        }
    }

    #[test]
    fn test_not_null() {
        let mut fuzzer = VectorFuzzer::new(options(1.0), 5);
        assert!(fuzzer.fuzz(&DataType::Integer).iter().all(Value::is_null));
        let values = fuzzer.fuzz_not_null(&DataType::Integer);
        assert!(!values.iter().any(Value::is_null));
    }

    #[test]
    fn test_timestamp_precision() {
        let mut fuzzer = VectorFuzzer::new(options(0.0), 11);
        for value in fuzzer.fuzz(&DataType::Timestamp) {
            let Value::Timestamp { nanos, .. } = value else {
                panic!("expected a timestamp");
            };
            assert_eq!(nanos % 1_000_000, 0);
        }
    }

    #[test]
    fn test_fixed_string_length() {
        let mut fuzzer = VectorFuzzer::new(
            VectorFuzzerOptions {
                string_variable_length: false,
                ..options(0.0)
            },
            3,
        );
        for value in fuzzer.fuzz(&DataType::Varchar) {
            let Value::Varchar(s) = value else {
                panic!("expected a string");
            };
            assert!(s.len() <= 2 || s.len() == 16);
        }
    }
}
