//! Functions implemented by [`crate::engine::LocalEngine`], with the
//! verifiers and input generators some of them need.

use std::collections::HashMap;
use std::sync::Arc;

use rand_chacha::ChaCha8Rng;

use crate::catalog::{FunctionEntry, FunctionRegistry};
use crate::input::{InputGenerator, InputGenerators};
use crate::signature::{FunctionMetadata, FunctionSignature, TypeSignature};
use crate::types::{DataType, Value};
use crate::vector_fuzzer::VectorGenerator;
use crate::verifier::{ArbitraryVerifier, ResultVerifier, UnorderedArrayVerifier};

const INTEGER_TYPES: [DataType; 4] = [
    DataType::TinyInt,
    DataType::SmallInt,
    DataType::Integer,
    DataType::BigInt,
];

/// Largest magnitude fed to `sum` and `avg`, so that no realistic input
/// size overflows a BIGINT accumulator.
const MAX_SUMMAND: i64 = 1_000_000_000;

fn t() -> TypeSignature {
    TypeSignature::var("T")
}

fn numeric(entry: FunctionEntry, integer_result: DataType) -> FunctionEntry {
    let entry = INTEGER_TYPES.iter().fold(entry, |entry, ty| {
        entry.signature(FunctionSignature::new(integer_result.clone()).arg(ty.clone()))
    });
    entry
        .signature(FunctionSignature::new(DataType::Real).arg(DataType::Real))
        .signature(FunctionSignature::new(DataType::Double).arg(DataType::Double))
}

fn min_max(metadata: FunctionMetadata) -> FunctionEntry {
    FunctionEntry::new(metadata)
        .signature(
            FunctionSignature::new(t())
                .orderable_type_variable("T")
                .arg(t()),
        )
        .signature(FunctionSignature::new(DataType::Real).arg(DataType::Real))
        .signature(FunctionSignature::new(DataType::Double).arg(DataType::Double))
        // Registered but not fuzzable.
        .signature(FunctionSignature::new(DataType::Date).arg(DataType::Date))
}

pub fn builtin_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    let aggregate = FunctionMetadata::aggregate();
    let peers_only = FunctionMetadata {
        order_sensitive: false,
        ..FunctionMetadata::window()
    };

    registry.insert(
        "count".to_string(),
        FunctionEntry::new(aggregate.distinct())
            .signature(FunctionSignature::new(DataType::BigInt))
            .signature(
                FunctionSignature::new(DataType::BigInt)
                    .type_variable("T")
                    .arg(t()),
            ),
    );
    registry.insert(
        "count_if".to_string(),
        FunctionEntry::new(aggregate)
            .signature(FunctionSignature::new(DataType::BigInt).arg(DataType::Boolean)),
    );
    registry.insert(
        "sum".to_string(),
        numeric(FunctionEntry::new(aggregate.distinct()), DataType::BigInt),
    );
    registry.insert(
        "avg".to_string(),
        numeric(FunctionEntry::new(aggregate.distinct()), DataType::Double),
    );
    registry.insert("min".to_string(), min_max(aggregate.distinct()));
    registry.insert("max".to_string(), min_max(aggregate.distinct()));
    registry.insert(
        "bool_and".to_string(),
        FunctionEntry::new(aggregate)
            .signature(FunctionSignature::new(DataType::Boolean).arg(DataType::Boolean)),
    );
    registry.insert(
        "bool_or".to_string(),
        FunctionEntry::new(aggregate)
            .signature(FunctionSignature::new(DataType::Boolean).arg(DataType::Boolean)),
    );
    registry.insert(
        "array_agg".to_string(),
        FunctionEntry::new(aggregate.order_sensitive()).signature(
            FunctionSignature::new(TypeSignature::array(t()))
                .type_variable("T")
                .arg(t()),
        ),
    );
    registry.insert(
        "arbitrary".to_string(),
        FunctionEntry::new(aggregate.non_deterministic()).signature(
            FunctionSignature::new(t())
                .type_variable("T")
                .arg(t()),
        ),
    );
    registry.insert(
        "row_number".to_string(),
        FunctionEntry::new(FunctionMetadata::window())
            .signature(FunctionSignature::new(DataType::BigInt)),
    );
    for name in ["rank", "dense_rank"] {
        registry.insert(
            name.to_string(),
            FunctionEntry::new(peers_only).signature(FunctionSignature::new(DataType::BigInt)),
        );
    }
    for name in ["lag", "lead"] {
        registry.insert(
            name.to_string(),
            FunctionEntry::new(FunctionMetadata::window()).signature(
                FunctionSignature::new(t())
                    .type_variable("T")
                    .arg(t()),
            ),
        );
    }
    registry
}

pub fn builtin_verifiers() -> HashMap<String, Arc<dyn ResultVerifier>> {
    let mut verifiers: HashMap<String, Arc<dyn ResultVerifier>> = HashMap::new();
    verifiers.insert("array_agg".to_string(), Arc::new(UnorderedArrayVerifier));
    verifiers.insert("arbitrary".to_string(), Arc::new(ArbitraryVerifier));
    verifiers
}

pub fn builtin_input_generators() -> InputGenerators {
    let mut generators: InputGenerators = HashMap::new();
    let bounded: Arc<dyn InputGenerator> = Arc::new(BoundedIntegers {
        max_abs: MAX_SUMMAND,
    });
    generators.insert("sum".to_string(), bounded.clone());
    generators.insert("avg".to_string(), bounded);
    generators
}

/// Keeps integer arguments within `[-max_abs, max_abs]`.
#[derive(Debug)]
pub struct BoundedIntegers {
    pub max_abs: i64,
}

impl InputGenerator for BoundedIntegers {
    fn generate(
        &self,
        types: &[DataType],
        generator: &mut dyn VectorGenerator,
        _rng: &mut ChaCha8Rng,
    ) -> Vec<Vec<Value>> {
        types
            .iter()
            .map(|ty| {
                let values = generator.fuzz(ty);
                if !ty.is_integer() {
                    return values;
                }
                values
                    .into_iter()
                    .map(|value| match value {
                        Value::Int(v) if v.unsigned_abs() > self.max_abs.unsigned_abs() => {
                            Value::Int(v % self.max_abs)
                        }
                        other => other,
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::catalog::SignatureCatalog;
    use crate::vector_fuzzer::{VectorFuzzer, VectorFuzzerOptions};

    #[test]
    fn test_builtin_catalog() {
        let catalog = SignatureCatalog::from_registry(&builtin_registry());
        let stats = catalog.functions_stats();
        assert_eq!(stats.num_functions, 15);
        // min(DATE) and max(DATE)
        assert_eq!(stats.num_signatures - stats.num_supported_signatures, 2);
        assert_eq!(stats.num_supported_functions, stats.num_functions);
        assert!(catalog.find("rank").is_some_and(|m| !m.order_sensitive));
        assert!(catalog.find("arbitrary").is_some_and(|m| !m.deterministic));
        let verifiers = builtin_verifiers();
        let generators = builtin_input_generators();
        for name in verifiers.keys().chain(generators.keys()) {
            assert!(catalog.contains_function(name), "{name}");
        }
    }

    #[test]
    fn test_bounded_integers() {
        let options = VectorFuzzerOptions {
            vector_size: 500,
            ..Default::default()
        };
        let mut generator = VectorFuzzer::new(options, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let columns = BoundedIntegers { max_abs: 1_000 }.generate(
            &[DataType::BigInt, DataType::Double],
            &mut generator,
            &mut rng,
        );
        assert_eq!(columns.len(), 2);
        assert!(columns[0]
            .iter()
            .all(|v| v.as_int().is_none_or(|v| v.unsigned_abs() <= 1_000)));
        assert_eq!(columns[1].len(), 500);
    }
}
