//! Logical types and values flowing through the fuzzer.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Logical column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Varchar,
    Varbinary,
    Timestamp,
    Date,
    IntervalDayTime,
    Unknown,
    Array(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
    Row(Vec<DataType>),
}

impl DataType {
    /// All primitive types, in declaration order.
    pub const PRIMITIVES: [DataType; 13] = [
        DataType::Boolean,
        DataType::TinyInt,
        DataType::SmallInt,
        DataType::Integer,
        DataType::BigInt,
        DataType::Real,
        DataType::Double,
        DataType::Varchar,
        DataType::Varbinary,
        DataType::Timestamp,
        DataType::Date,
        DataType::IntervalDayTime,
        DataType::Unknown,
    ];

    pub fn array(element: DataType) -> Self {
        DataType::Array(Box::new(element))
    }

    pub fn map(key: DataType, value: DataType) -> Self {
        DataType::Map(Box::new(key), Box::new(value))
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            DataType::Array(_) | DataType::Map(..) | DataType::Row(_)
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt
        )
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, DataType::Real | DataType::Double)
    }

    /// Maps have no ordering. Arrays and rows are orderable when their
    /// children are.
    pub fn is_orderable(&self) -> bool {
        match self {
            DataType::Map(..) => false,
            DataType::Array(element) => element.is_orderable(),
            DataType::Row(fields) => fields.iter().all(DataType::is_orderable),
            _ => true,
        }
    }

    pub fn children(&self) -> Vec<&DataType> {
        match self {
            DataType::Array(element) => vec![element.as_ref()],
            DataType::Map(key, value) => vec![key.as_ref(), value.as_ref()],
            DataType::Row(fields) => fields.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Inclusive value range of an integer type.
    pub fn integer_bounds(&self) -> Option<(i64, i64)> {
        match self {
            DataType::TinyInt => Some((i8::MIN as i64, i8::MAX as i64)),
            DataType::SmallInt => Some((i16::MIN as i64, i16::MAX as i64)),
            DataType::Integer => Some((i32::MIN as i64, i32::MAX as i64)),
            DataType::BigInt => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::TinyInt => write!(f, "TINYINT"),
            DataType::SmallInt => write!(f, "SMALLINT"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Real => write!(f, "REAL"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::Varchar => write!(f, "VARCHAR"),
            DataType::Varbinary => write!(f, "VARBINARY"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Date => write!(f, "DATE"),
            DataType::IntervalDayTime => write!(f, "INTERVAL DAY TO SECOND"),
            DataType::Unknown => write!(f, "UNKNOWN"),
            DataType::Array(element) => write!(f, "ARRAY({element})"),
            DataType::Map(key, value) => write!(f, "MAP({key}, {value})"),
            DataType::Row(fields) => {
                write!(f, "ROW(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A single cell value.
///
/// All integer widths share [`Value::Int`] and both floating point widths
/// share [`Value::Double`]; the column's [`DataType`] carries the width.
/// Values are totally ordered (nulls first, `-0.0 == 0.0`, all NaNs equal)
/// so they can serve as grouping and sorting keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Double(#[serde(with = "double_repr")] f64),
    Varchar(String),
    Varbinary(Vec<u8>),
    Timestamp { seconds: i64, nanos: u32 },
    Date(i32),
    /// Milliseconds.
    Interval(i64),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Row(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Rough in-memory footprint, used for memory pool accounting.
    pub fn estimated_size(&self) -> usize {
        let base = std::mem::size_of::<Value>();
        match self {
            Value::Varchar(s) => base + s.len(),
            Value::Varbinary(b) => base + b.len(),
            Value::Array(items) | Value::Row(items) => {
                base + items.iter().map(Value::estimated_size).sum::<usize>()
            }
            Value::Map(entries) => {
                base + entries
                    .iter()
                    .map(|(k, v)| k.estimated_size() + v.estimated_size())
                    .sum::<usize>()
            }
            _ => base,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 2,
            Value::Double(_) => 3,
            Value::Varchar(_) => 4,
            Value::Varbinary(_) => 5,
            Value::Timestamp { .. } => 6,
            Value::Date(_) => 7,
            Value::Interval(_) => 8,
            Value::Array(_) => 9,
            Value::Map(_) => 10,
            Value::Row(_) => 11,
        }
    }

    /// Equality that tolerates floating point rounding differences.
    pub fn approx_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => floats_approximately_equal(*a, *b),
            (Value::Array(a), Value::Array(b)) | (Value::Row(a), Value::Row(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.approx_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka.approx_eq(kb) && va.approx_eq(vb))
            }
            _ => self == other,
        }
    }
}

fn canonical_double(v: f64) -> f64 {
    if v.is_nan() {
        f64::NAN
    } else if v == 0.0 {
        0.0
    } else {
        v
    }
}

pub fn floats_approximately_equal(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    let abs_diff = (a - b).abs();
    let max_abs = a.abs().max(b.abs());
    // Absolute tolerance near zero, relative otherwise.
    if max_abs < 1.0 {
        abs_diff < 1e-6
    } else {
        abs_diff / max_abs < 1e-6
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => {
                canonical_double(*a).total_cmp(&canonical_double(*b))
            }
            (Value::Varchar(a), Value::Varchar(b)) => a.cmp(b),
            (Value::Varbinary(a), Value::Varbinary(b)) => a.cmp(b),
            (
                Value::Timestamp {
                    seconds: s1,
                    nanos: n1,
                },
                Value::Timestamp {
                    seconds: s2,
                    nanos: n2,
                },
            ) => (s1, n1).cmp(&(s2, n2)),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Interval(a), Value::Interval(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) | (Value::Row(a), Value::Row(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Double(v) => canonical_double(*v).to_bits().hash(state),
            Value::Varchar(v) => v.hash(state),
            Value::Varbinary(v) => v.hash(state),
            Value::Timestamp { seconds, nanos } => {
                seconds.hash(state);
                nanos.hash(state);
            }
            Value::Date(v) => v.hash(state),
            Value::Interval(v) => v.hash(state),
            Value::Array(items) | Value::Row(items) => items.hash(state),
            Value::Map(entries) => entries.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Varchar(v) => write!(f, "'{v}'"),
            Value::Varbinary(v) => {
                write!(f, "X'")?;
                for byte in v {
                    write!(f, "{byte:02X}")?;
                }
                write!(f, "'")
            }
            Value::Timestamp { seconds, nanos } => write!(f, "{seconds}.{nanos:09}"),
            Value::Date(v) => write!(f, "date({v})"),
            Value::Interval(v) => write!(f, "interval({v}ms)"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Row(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// JSON has no NaN or infinity, so non-finite doubles are written as strings.
mod double_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orderability() {
        assert!(DataType::BigInt.is_orderable());
        assert!(DataType::array(DataType::Varchar).is_orderable());
        assert!(!DataType::map(DataType::BigInt, DataType::Double).is_orderable());
        assert!(!DataType::array(DataType::map(DataType::BigInt, DataType::BigInt)).is_orderable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DataType::array(DataType::BigInt).to_string(),
            "ARRAY(BIGINT)"
        );
        assert_eq!(
            DataType::Row(vec![DataType::Integer, DataType::Varchar]).to_string(),
            "ROW(INTEGER, VARCHAR)"
        );
    }

    #[test]
    fn test_double_normalization() {
        assert_eq!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::Double(f64::NAN), Value::Double(-f64::NAN));
        assert!(Value::Null < Value::Int(i64::MIN));
        assert!(Value::Double(1.0) < Value::Double(f64::NAN));
    }

    #[test]
    fn test_approx_eq() {
        assert!(Value::Double(0.1 + 0.2).approx_eq(&Value::Double(0.3)));
        assert!(!Value::Double(1.0).approx_eq(&Value::Double(1.1)));
        assert!(Value::Array(vec![Value::Double(1e9)])
            .approx_eq(&Value::Array(vec![Value::Double(1e9 + 1e-3)])));
    }

    #[test]
    fn test_non_finite_json() {
        let values = vec![
            Value::Double(f64::INFINITY),
            Value::Double(f64::NEG_INFINITY),
            Value::Double(2.5),
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, back);
    }
}
