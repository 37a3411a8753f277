//! Aggregate accumulators with partial/final support.
//!
//! Accumulator state serializes to JSON so it can be spilled and reloaded.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{DataType, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    Count(i64),
    CountIf(i64),
    /// Exact sum, overflow is checked once at the end so that the outcome does
    /// not depend on the order rows are added in.
    SumInt {
        #[serde(with = "i128_repr")]
        sum: i128,
        seen: bool,
    },
    SumDouble {
        sum: f64,
        compensation: f64,
        seen: bool,
    },
    AvgInt {
        #[serde(with = "i128_repr")]
        sum: i128,
        count: i64,
    },
    AvgDouble {
        sum: f64,
        compensation: f64,
        count: i64,
    },
    Min(Option<Value>),
    Max(Option<Value>),
    BoolAnd(Option<bool>),
    BoolOr(Option<bool>),
    ArrayAgg(Vec<Value>),
    Arbitrary(Option<Value>),
}

impl Accumulator {
    pub fn new(function: &str, arg_types: &[DataType]) -> Result<Self, EngineError> {
        let first = arg_types.first();
        let is_integer = first.is_some_and(DataType::is_integer);
        let is_floating = first.is_some_and(DataType::is_floating_point);
        let accumulator = match function {
            "count" => Accumulator::Count(0),
            "count_if" => Accumulator::CountIf(0),
            "sum" if is_integer => Accumulator::SumInt { sum: 0, seen: false },
            "sum" if is_floating => Accumulator::SumDouble {
                sum: 0.0,
                compensation: 0.0,
                seen: false,
            },
            "avg" if is_integer => Accumulator::AvgInt { sum: 0, count: 0 },
            "avg" if is_floating => Accumulator::AvgDouble {
                sum: 0.0,
                compensation: 0.0,
                count: 0,
            },
            "min" => Accumulator::Min(None),
            "max" => Accumulator::Max(None),
            "bool_and" => Accumulator::BoolAnd(None),
            "bool_or" => Accumulator::BoolOr(None),
            "array_agg" => Accumulator::ArrayAgg(Vec::new()),
            "arbitrary" => Accumulator::Arbitrary(None),
            _ => {
                return Err(EngineError::Runtime(format!(
                    "no aggregate {function} for argument types {arg_types:?}"
                )))
            }
        };
        Ok(accumulator)
    }

    pub fn add_input(&mut self, args: &[Value]) -> Result<(), EngineError> {
        let arg = args.first().unwrap_or(&Value::Null);
        match self {
            Accumulator::Count(count) => {
                // count(*) has no arguments and counts every row.
                if args.is_empty() || !arg.is_null() {
                    *count += 1;
                }
            }
            Accumulator::CountIf(count) => {
                if arg.as_bool() == Some(true) {
                    *count += 1;
                }
            }
            Accumulator::SumInt { sum, seen } => {
                if let Value::Int(v) = arg {
                    *sum += *v as i128;
                    *seen = true;
                }
            }
            Accumulator::SumDouble {
                sum,
                compensation,
                seen,
            } => {
                if let Some(v) = non_null_double(arg) {
                    neumaier_add(sum, compensation, v);
                    *seen = true;
                }
            }
            Accumulator::AvgInt { sum, count } => {
                if let Value::Int(v) = arg {
                    *sum += *v as i128;
                    *count += 1;
                }
            }
            Accumulator::AvgDouble {
                sum,
                compensation,
                count,
            } => {
                if let Some(v) = non_null_double(arg) {
                    neumaier_add(sum, compensation, v);
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !arg.is_null() && current.as_ref().is_none_or(|c| arg < c) {
                    *current = Some(arg.clone());
                }
            }
            Accumulator::Max(current) => {
                if !arg.is_null() && current.as_ref().is_none_or(|c| arg > c) {
                    *current = Some(arg.clone());
                }
            }
            Accumulator::BoolAnd(current) => {
                if let Some(v) = arg.as_bool() {
                    *current = Some(current.unwrap_or(true) && v);
                }
            }
            Accumulator::BoolOr(current) => {
                if let Some(v) = arg.as_bool() {
                    *current = Some(current.unwrap_or(false) || v);
                }
            }
            Accumulator::ArrayAgg(items) => items.push(arg.clone()),
            Accumulator::Arbitrary(current) => {
                if current.is_none() && !arg.is_null() {
                    *current = Some(arg.clone());
                }
            }
        }
        Ok(())
    }

    /// Folds another partial state of the same function into this one.
    pub fn merge(&mut self, other: Accumulator) -> Result<(), EngineError> {
        match (self, other) {
            (Accumulator::Count(a), Accumulator::Count(b))
            | (Accumulator::CountIf(a), Accumulator::CountIf(b)) => *a += b,
            (
                Accumulator::SumInt { sum, seen },
                Accumulator::SumInt {
                    sum: other_sum,
                    seen: other_seen,
                },
            ) => {
                *sum += other_sum;
                *seen |= other_seen;
            }
            (
                Accumulator::SumDouble {
                    sum,
                    compensation,
                    seen,
                },
                Accumulator::SumDouble {
                    sum: other_sum,
                    compensation: other_compensation,
                    seen: other_seen,
                },
            ) => {
                neumaier_add(sum, compensation, other_sum);
                *compensation += other_compensation;
                *seen |= other_seen;
            }
            (
                Accumulator::AvgInt { sum, count },
                Accumulator::AvgInt {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (
                Accumulator::AvgDouble {
                    sum,
                    compensation,
                    count,
                },
                Accumulator::AvgDouble {
                    sum: other_sum,
                    compensation: other_compensation,
                    count: other_count,
                },
            ) => {
                neumaier_add(sum, compensation, other_sum);
                *compensation += other_compensation;
                *count += other_count;
            }
            (Accumulator::Min(current), Accumulator::Min(other)) => {
                if let Some(v) = other {
                    if current.as_ref().is_none_or(|c| &v < c) {
                        *current = Some(v);
                    }
                }
            }
            (Accumulator::Max(current), Accumulator::Max(other)) => {
                if let Some(v) = other {
                    if current.as_ref().is_none_or(|c| &v > c) {
                        *current = Some(v);
                    }
                }
            }
            (Accumulator::BoolAnd(current), Accumulator::BoolAnd(other)) => {
                if let Some(v) = other {
                    *current = Some(current.unwrap_or(true) && v);
                }
            }
            (Accumulator::BoolOr(current), Accumulator::BoolOr(other)) => {
                if let Some(v) = other {
                    *current = Some(current.unwrap_or(false) || v);
                }
            }
            (Accumulator::ArrayAgg(items), Accumulator::ArrayAgg(other)) => items.extend(other),
            (Accumulator::Arbitrary(current), Accumulator::Arbitrary(other)) => {
                if current.is_none() {
                    *current = other;
                }
            }
            (this, other) => {
                return Err(EngineError::Runtime(format!(
                    "cannot merge accumulator state {other:?} into {this:?}"
                )))
            }
        }
        Ok(())
    }

    pub fn finalize(&self, result_type: &DataType) -> Result<Value, EngineError> {
        let value = match self {
            Accumulator::Count(count) | Accumulator::CountIf(count) => Value::Int(*count),
            Accumulator::SumInt { sum, seen } => {
                if !*seen {
                    Value::Null
                } else {
                    let sum = i64::try_from(*sum)
                        .map_err(|_| EngineError::User(format!("integer overflow: {sum}")))?;
                    Value::Int(sum)
                }
            }
            Accumulator::SumDouble {
                sum,
                compensation,
                seen,
            } => {
                if !*seen {
                    Value::Null
                } else {
                    Value::Double(round_to_type(sum + compensation, result_type))
                }
            }
            Accumulator::AvgInt { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Double(*sum as f64 / *count as f64)
                }
            }
            Accumulator::AvgDouble {
                sum,
                compensation,
                count,
            } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Double(round_to_type((sum + compensation) / *count as f64, result_type))
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::Arbitrary(v) => {
                v.clone().unwrap_or(Value::Null)
            }
            Accumulator::BoolAnd(v) | Accumulator::BoolOr(v) => {
                v.map_or(Value::Null, Value::Boolean)
            }
            Accumulator::ArrayAgg(items) => {
                if items.is_empty() {
                    Value::Null
                } else {
                    Value::Array(items.clone())
                }
            }
        };
        Ok(value)
    }
}

fn non_null_double(value: &Value) -> Option<f64> {
    match value {
        Value::Double(v) => Some(*v),
        Value::Int(v) => Some(*v as f64),
        _ => None,
    }
}

fn round_to_type(value: f64, result_type: &DataType) -> f64 {
    if *result_type == DataType::Real {
        value as f32 as f64
    } else {
        value
    }
}

/// Kahan-Babuska-Neumaier compensated summation.
fn neumaier_add(sum: &mut f64, compensation: &mut f64, value: f64) {
    let t = *sum + value;
    if !t.is_finite() {
        *sum = t;
        return;
    }
    if sum.abs() >= value.abs() {
        *compensation += (*sum - t) + value;
    } else {
        *compensation += (value - t) + *sum;
    }
    *sum = t;
}

/// JSON numbers do not portably hold 128-bit integers.
mod i128_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(function: &str, ty: DataType, values: &[Value]) -> Accumulator {
        let mut acc = Accumulator::new(function, &[ty]).unwrap();
        for v in values {
            acc.add_input(std::slice::from_ref(v)).unwrap();
        }
        acc
    }

    #[test]
    fn test_sum_overflow_is_order_independent() {
        let values = [Value::Int(i64::MAX), Value::Int(1), Value::Int(-1)];
        let acc = run("sum", DataType::BigInt, &values);
        assert_eq!(
            acc.finalize(&DataType::BigInt).unwrap(),
            Value::Int(i64::MAX)
        );

        let values = [Value::Int(i64::MAX), Value::Int(1)];
        let overflow = run("sum", DataType::BigInt, &values);
        assert!(matches!(
            overflow.finalize(&DataType::BigInt),
            Err(EngineError::User(_))
        ));
    }

    #[test]
    fn test_split_and_merge_matches_single() {
        let values: Vec<Value> = (0..100)
            .map(|i| {
                if i % 7 == 0 {
                    Value::Null
                } else {
                    Value::Double(i as f64 * 0.1)
                }
            })
            .collect();
        for function in ["sum", "avg", "min", "max", "count"] {
            let single = run(function, DataType::Double, &values);
            let mut left = run(function, DataType::Double, &values[..37]);
            let right = run(function, DataType::Double, &values[37..]);
            left.merge(right).unwrap();
            assert!(single
                .finalize(&DataType::Double)
                .unwrap()
                .approx_eq(&left.finalize(&DataType::Double).unwrap()));
        }
    }

    #[test]
    fn test_empty_input() {
        let sum = run("sum", DataType::BigInt, &[Value::Null]);
        assert_eq!(sum.finalize(&DataType::BigInt).unwrap(), Value::Null);
        let count = run("count", DataType::BigInt, &[Value::Null]);
        assert_eq!(count.finalize(&DataType::BigInt).unwrap(), Value::Int(0));
        let mut star = Accumulator::new("count", &[]).unwrap();
        star.add_input(&[]).unwrap();
        assert_eq!(star.finalize(&DataType::BigInt).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_merge_mismatch() {
        let mut count = Accumulator::Count(1);
        assert!(count.merge(Accumulator::Min(None)).is_err());
    }

    #[test]
    fn test_state_survives_json() {
        let values = [Value::Int(i64::MAX), Value::Int(i64::MAX)];
        let acc = run("avg", DataType::BigInt, &values);
        let json = serde_json::to_string(&acc).unwrap();
        let back: Accumulator = serde_json::from_str(&json).unwrap();
        assert_eq!(acc, back);
    }
}
