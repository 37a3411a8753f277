//! Input batch synthesis.

use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::batch::{Column, RowBatch};
use crate::catalog::SignatureCatalog;
use crate::error::{FuzzerError, Result};
use crate::memory::MemoryPool;
use crate::signature::CallableSignature;
use crate::types::{DataType, Value};
use crate::vector_fuzzer::VectorGenerator;

/// Name of the identity column appended for window inputs.
pub const ROW_NUMBER_COLUMN: &str = "row_number";

const MAX_NUM_KEYS: usize = 5;
/// Frame bound columns hold offsets in `[0, FRAME_BOUND_RANGE)`.
const FRAME_BOUND_RANGE: i64 = 11;

/// Produces argument columns for a specific function, e.g. to keep values in
/// the function's domain.
pub trait InputGenerator: Send + Sync {
    /// Returns one vector of `vector_size` values per argument type, or an
    /// empty vector to fall back to the default generator.
    fn generate(
        &self,
        types: &[DataType],
        generator: &mut dyn VectorGenerator,
        rng: &mut ChaCha8Rng,
    ) -> Vec<Vec<Value>>;
}

pub type InputGenerators = HashMap<String, Arc<dyn InputGenerator>>;

#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub batch_size: usize,
    pub num_batches: usize,
    pub supported_key_types: Vec<DataType>,
    /// Restrict grouping keys to orderable types.
    pub orderable_group_keys: bool,
}

pub struct InputSynthesizer {
    config: SynthesizerConfig,
    generator: Box<dyn VectorGenerator>,
    custom_generators: InputGenerators,
    rng: ChaCha8Rng,
    pool: MemoryPool,
}

impl InputSynthesizer {
    /// Fails when a custom generator is registered for a function the
    /// catalog does not know.
    pub fn new(
        config: SynthesizerConfig,
        generator: Box<dyn VectorGenerator>,
        custom_generators: InputGenerators,
        catalog: &SignatureCatalog,
        pool: MemoryPool,
    ) -> Result<Self> {
        if let Some(unknown) = custom_generators
            .keys()
            .find(|name| !catalog.contains_function(name))
        {
            return Err(FuzzerError::UnknownInputGenerator(unknown.clone()));
        }
        if config.supported_key_types.is_empty() {
            return Err(FuzzerError::NoKeyTypes);
        }
        if generator.options().vector_size != config.batch_size {
            return Err(FuzzerError::InvalidOptions(format!(
                "vector size {} does not match batch size {}",
                generator.options().vector_size,
                config.batch_size
            )));
        }
        Ok(Self {
            config,
            generator,
            custom_generators,
            rng: ChaCha8Rng::seed_from_u64(0),
            pool,
        })
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        let generator_seed = self.rng.next_u64();
        self.generator.reseed(generator_seed);
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    pub fn has_custom_generator(&self, name: &str) -> bool {
        self.custom_generators.contains_key(name)
    }

    /// Builds `num_batches` batches. The leading `signature.args.len()`
    /// columns are the function arguments; a registered custom generator
    /// gets to produce them first.
    pub fn generate_input_data(
        &mut self,
        names: &[String],
        types: &[DataType],
        signature: Option<&CallableSignature>,
    ) -> Result<Vec<RowBatch>> {
        let mut batches = Vec::with_capacity(self.config.num_batches);
        for _ in 0..self.config.num_batches {
            let mut columns = self.generate_custom_columns(names, types, signature)?;
            for i in columns.len()..names.len() {
                columns.push(Column::new(
                    names[i].clone(),
                    types[i].clone(),
                    self.generator.fuzz(&types[i]),
                ));
            }
            batches.push(self.account(RowBatch::try_new(columns)?)?);
        }
        Ok(batches)
    }

    /// Like [`Self::generate_input_data`], plus an INTEGER `row_number`
    /// column counting from zero across batches. Partition keys, sorting
    /// keys and frame bounds never contain nulls; frame bounds are small
    /// non-negative offsets.
    pub fn generate_input_data_with_row_number(
        &mut self,
        names: &[String],
        types: &[DataType],
        partition_keys: &[String],
        frame_bounds: &[String],
        sorting_keys: &[String],
        signature: Option<&CallableSignature>,
    ) -> Result<Vec<RowBatch>> {
        let mut batches = Vec::with_capacity(self.config.num_batches);
        let mut row_number = 0i64;
        for _ in 0..self.config.num_batches {
            let mut columns = self.generate_custom_columns(names, types, signature)?;
            for i in columns.len()..names.len() {
                let values = if frame_bounds.contains(&names[i]) {
                    self.generator
                        .fuzz_not_null(&types[i])
                        .into_iter()
                        .map(|v| match v {
                            Value::Int(n) => Value::Int(n.rem_euclid(FRAME_BOUND_RANGE)),
                            other => other,
                        })
                        .collect()
                } else if partition_keys.contains(&names[i]) || sorting_keys.contains(&names[i]) {
                    self.generator.fuzz_not_null(&types[i])
                } else {
                    self.generator.fuzz(&types[i])
                };
                columns.push(Column::new(names[i].clone(), types[i].clone(), values));
            }
            let size = self.config.batch_size as i64;
            columns.push(Column::new(
                ROW_NUMBER_COLUMN,
                DataType::Integer,
                (row_number..row_number + size).map(Value::Int).collect(),
            ));
            row_number += size;
            batches.push(self.account(RowBatch::try_new(columns)?)?);
        }
        Ok(batches)
    }

    fn generate_custom_columns(
        &mut self,
        names: &[String],
        types: &[DataType],
        signature: Option<&CallableSignature>,
    ) -> Result<Vec<Column>> {
        let Some(signature) = signature else {
            return Ok(Vec::new());
        };
        let Some(custom) = self.custom_generators.get(&signature.name).cloned() else {
            return Ok(Vec::new());
        };
        let num_args = signature.args.len().min(types.len());
        let data = custom.generate(&types[..num_args], self.generator.as_mut(), &mut self.rng);
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data.len() != num_args {
            return Err(FuzzerError::MalformedInput {
                function: signature.name.clone(),
                reason: format!("expected {num_args} columns, got {}", data.len()),
            });
        }
        data.into_iter()
            .enumerate()
            .map(|(i, values)| {
                if values.len() != self.config.batch_size {
                    return Err(FuzzerError::MalformedInput {
                        function: signature.name.clone(),
                        reason: format!(
                            "column {i} has {} rows, expected {}",
                            values.len(),
                            self.config.batch_size
                        ),
                    });
                }
                Ok(Column::new(names[i].clone(), types[i].clone(), values))
            })
            .collect()
    }

    fn account(&self, batch: RowBatch) -> Result<RowBatch> {
        self.pool.reserve(batch.estimated_size())?;
        Ok(batch)
    }

    /// Releases the memory reserved for this iteration's input.
    pub fn release_input(&self) -> Result<()> {
        self.pool.release_all()
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Appends between one and five keys named `<prefix>N` to `names` and
    /// `types`, returning the key names.
    pub fn generate_keys(
        &mut self,
        prefix: &str,
        names: &mut Vec<String>,
        types: &mut Vec<DataType>,
    ) -> Vec<String> {
        let num_keys = self.rng.random_range(1..=MAX_NUM_KEYS);
        let mut keys = Vec::with_capacity(num_keys);
        for i in 0..num_keys {
            let key_type = self.random_key_type();
            let name = format!("{prefix}{i}");
            names.push(name.clone());
            types.push(key_type);
            keys.push(name);
        }
        keys
    }

    /// Like [`Self::generate_keys`] but only orderable types are used.
    /// Exactly one key is generated for RANGE frames. `scalar_types`, when
    /// non-empty, replaces the supported key types as the type pool.
    pub fn generate_sorting_keys(
        &mut self,
        prefix: &str,
        names: &mut Vec<String>,
        types: &mut Vec<DataType>,
        range_frame: bool,
        scalar_types: &[DataType],
        num_keys: Option<usize>,
    ) -> Vec<String> {
        let num_keys = if range_frame {
            1
        } else {
            num_keys.unwrap_or_else(|| self.rng.random_range(1..=MAX_NUM_KEYS))
        };
        let pool: Vec<DataType> = if scalar_types.is_empty() {
            self.config
                .supported_key_types
                .iter()
                .filter(|t| t.is_orderable())
                .cloned()
                .collect()
        } else {
            scalar_types.to_vec()
        };
        let mut keys = Vec::with_capacity(num_keys);
        if pool.is_empty() {
            return keys;
        }
        for i in 0..num_keys {
            let key_type = pool[self.rng.random_range(0..pool.len())].clone();
            let name = format!("{prefix}{i}");
            names.push(name.clone());
            types.push(key_type);
            keys.push(name);
        }
        keys
    }

    fn random_key_type(&mut self) -> DataType {
        let key_types = &self.config.supported_key_types;
        let scalar = key_types[self.rng.random_range(0..key_types.len())].clone();
        if self.config.orderable_group_keys || !self.rng.random_bool(0.1) {
            return scalar;
        }
        if self.rng.random_bool(0.5) {
            DataType::array(scalar)
        } else {
            let value = key_types[self.rng.random_range(0..key_types.len())].clone();
            DataType::map(scalar, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::make_names;
    use crate::signature::{FunctionMetadata, FunctionSignature};
    use crate::vector_fuzzer::{VectorFuzzer, VectorFuzzerOptions};

    struct PositiveOnly;

    impl InputGenerator for PositiveOnly {
        fn generate(
            &self,
            types: &[DataType],
            generator: &mut dyn VectorGenerator,
            _rng: &mut ChaCha8Rng,
        ) -> Vec<Vec<Value>> {
            types
                .iter()
                .map(|ty| {
                    generator
                        .fuzz_not_null(ty)
                        .into_iter()
                        .map(|v| Value::Int(v.as_int().unwrap_or(0).rem_euclid(100) + 1))
                        .collect()
                })
                .collect()
        }
    }

    struct Truncating;

    impl InputGenerator for Truncating {
        fn generate(
            &self,
            types: &[DataType],
            _generator: &mut dyn VectorGenerator,
            _rng: &mut ChaCha8Rng,
        ) -> Vec<Vec<Value>> {
            types.iter().map(|_| vec![Value::Int(1)]).collect()
        }
    }

    fn catalog() -> SignatureCatalog {
        let mut catalog = SignatureCatalog::new();
        catalog.register(
            "sum",
            FunctionMetadata::aggregate(),
            FunctionSignature::new(DataType::BigInt).arg(DataType::BigInt),
        );
        catalog
    }

    fn sum_signature() -> CallableSignature {
        catalog().signatures()[0].clone()
    }

    fn synthesizer(generators: InputGenerators) -> Result<InputSynthesizer> {
        let options = VectorFuzzerOptions {
            vector_size: 50,
            ..Default::default()
        };
        let pool = MemoryPool::root("test", None).add_leaf_child("leaf")?;
        InputSynthesizer::new(
            SynthesizerConfig {
                batch_size: 50,
                num_batches: 3,
                supported_key_types: vec![DataType::BigInt, DataType::Varchar],
                orderable_group_keys: true,
            },
            Box::new(VectorFuzzer::new(options, 0)),
            generators,
            &catalog(),
            pool,
        )
    }

    #[test]
    fn test_unknown_generator_rejected() {
        let mut generators: InputGenerators = HashMap::new();
        generators.insert("no_such_function".to_string(), Arc::new(PositiveOnly));
        assert!(matches!(
            synthesizer(generators),
            Err(FuzzerError::UnknownInputGenerator(_))
        ));
    }

    #[test]
    fn test_custom_generator_used() {
        let mut generators: InputGenerators = HashMap::new();
        generators.insert("sum".to_string(), Arc::new(PositiveOnly));
        let mut synthesizer = synthesizer(generators).unwrap();
        synthesizer.reseed(1);
        let batches = synthesizer
            .generate_input_data(&make_names(1), &[DataType::BigInt], Some(&sum_signature()))
            .unwrap();
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            let column = batch.column("c0").unwrap();
            assert!(column
                .values
                .iter()
                .all(|v| matches!(v, Value::Int(n) if (1..=100).contains(n))));
        }
        assert!(synthesizer.memory_pool().used() > 0);
        synthesizer.release_input().unwrap();
        assert_eq!(synthesizer.memory_pool().used(), 0);
    }

    #[test]
    fn test_malformed_generator_output() {
        let mut generators: InputGenerators = HashMap::new();
        generators.insert("sum".to_string(), Arc::new(Truncating));
        let mut synthesizer = synthesizer(generators).unwrap();
        let result = synthesizer.generate_input_data(
            &make_names(1),
            &[DataType::BigInt],
            Some(&sum_signature()),
        );
        assert!(matches!(result, Err(FuzzerError::MalformedInput { .. })));
    }

    #[test]
    fn test_row_number_and_non_null_keys() {
        let mut synthesizer = synthesizer(HashMap::new()).unwrap();
        synthesizer.reseed(7);
        let mut names = make_names(1);
        let mut types = vec![DataType::BigInt];
        let partition_keys = synthesizer.generate_keys("p", &mut names, &mut types);
        names.push("k0".to_string());
        types.push(DataType::BigInt);
        let batches = synthesizer
            .generate_input_data_with_row_number(
                &names,
                &types,
                &partition_keys,
                &["k0".to_string()],
                &[],
                None,
            )
            .unwrap();

        let mut expected = 0;
        for batch in &batches {
            for value in &batch.column(ROW_NUMBER_COLUMN).unwrap().values {
                assert_eq!(value, &Value::Int(expected));
                expected += 1;
            }
            for key in &partition_keys {
                assert_eq!(batch.column(key).unwrap().null_count(), 0);
            }
            assert!(batch
                .column("k0")
                .unwrap()
                .values
                .iter()
                .all(|v| matches!(v, Value::Int(n) if (0..FRAME_BOUND_RANGE).contains(n))));
        }
        assert_eq!(expected, 150);
        synthesizer.release_input().unwrap();
    }

    #[test]
    fn test_key_generation() {
        let mut synthesizer = synthesizer(HashMap::new()).unwrap();
        synthesizer.reseed(3);
        for _ in 0..20 {
            let mut names = Vec::new();
            let mut types = Vec::new();
            let keys = synthesizer.generate_keys("g", &mut names, &mut types);
            assert!((1..=MAX_NUM_KEYS).contains(&keys.len()));
            assert_eq!(keys[0], "g0");
            assert_eq!(names, keys);

            let sorting = synthesizer.generate_sorting_keys(
                "s",
                &mut names,
                &mut types,
                true,
                &[DataType::BigInt],
                None,
            );
            assert_eq!(sorting, vec!["s0".to_string()]);
            assert_eq!(types.last(), Some(&DataType::BigInt));
        }
    }
}
