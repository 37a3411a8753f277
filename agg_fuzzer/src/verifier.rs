//! Custom result verifiers for functions whose output cannot be compared
//! value by value.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::batch::RowBatch;
use crate::types::Value;

/// What a verifier needs to know about the query that produced a result.
#[derive(Debug, Clone, Copy)]
pub struct VerificationContext<'a> {
    pub input: &'a [RowBatch],
    /// Grouping keys for aggregations, partition keys for windows.
    pub keys: &'a [String],
    pub function: &'a str,
    pub args: &'a [String],
    /// Output column holding the function result.
    pub output: &'a str,
    /// Window results are computed over frames, not whole groups.
    pub window: bool,
}

pub trait ResultVerifier: Send + Sync {
    /// Whether [`ResultVerifier::compare`] can check two results against
    /// each other.
    fn supports_compare(&self) -> bool;

    /// Whether [`ResultVerifier::verify`] can check a result on its own.
    fn supports_verify(&self) -> bool;

    fn compare(
        &self,
        ctx: &VerificationContext<'_>,
        result: &RowBatch,
        other: &RowBatch,
    ) -> Result<(), String>;

    fn verify(&self, ctx: &VerificationContext<'_>, result: &RowBatch) -> Result<(), String>;
}

fn project(batch: &RowBatch, columns: &[&str]) -> Result<Vec<Vec<Value>>, String> {
    let indices = columns
        .iter()
        .map(|c| {
            batch
                .column_index(c)
                .ok_or_else(|| format!("result has no column {c}"))
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok((0..batch.num_rows())
        .map(|row| {
            indices
                .iter()
                .map(|&i| batch.columns()[i].values[row].clone())
                .collect()
        })
        .collect())
}

/// Compares array results ignoring the order of the array elements, e.g.
/// for `array_agg` over unordered input.
#[derive(Debug, Default)]
pub struct UnorderedArrayVerifier;

impl UnorderedArrayVerifier {
    fn normalize(
        ctx: &VerificationContext<'_>,
        batch: &RowBatch,
    ) -> Result<Vec<Vec<Value>>, String> {
        let mut columns: Vec<&str> = ctx.keys.iter().map(String::as_str).collect();
        columns.push(ctx.output);
        let rows = project(batch, &columns)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|value| match value {
                        Value::Array(items) => Value::Array(items.into_iter().sorted().collect()),
                        other => other,
                    })
                    .collect()
            })
            .sorted()
            .collect())
    }
}

impl ResultVerifier for UnorderedArrayVerifier {
    fn supports_compare(&self) -> bool {
        true
    }

    fn supports_verify(&self) -> bool {
        false
    }

    fn compare(
        &self,
        ctx: &VerificationContext<'_>,
        result: &RowBatch,
        other: &RowBatch,
    ) -> Result<(), String> {
        let left = Self::normalize(ctx, result)?;
        let right = Self::normalize(ctx, other)?;
        if left.len() != right.len() {
            return Err(format!("{} rows vs {} rows", left.len(), right.len()));
        }
        for (l, r) in left.iter().zip(&right) {
            if l.len() != r.len() || l.iter().zip(r).any(|(a, b)| !a.approx_eq(b)) {
                return Err(format!(
                    "{} differs ignoring element order: {l:?} vs {r:?}",
                    ctx.function
                ));
            }
        }
        Ok(())
    }

    fn verify(&self, _ctx: &VerificationContext<'_>, _result: &RowBatch) -> Result<(), String> {
        Ok(())
    }
}

/// Checks that every result of a function returning one of its inputs,
/// such as `arbitrary`, is one of the non-null values of its group.
#[derive(Debug, Default)]
pub struct ArbitraryVerifier;

impl ArbitraryVerifier {
    fn candidates(
        ctx: &VerificationContext<'_>,
    ) -> Result<HashMap<Vec<Value>, HashSet<Value>>, String> {
        let Some(arg) = ctx.args.first() else {
            return Err(format!("{} takes one argument", ctx.function));
        };
        let mut columns: Vec<&str> = ctx.keys.iter().map(String::as_str).collect();
        columns.push(arg);
        let mut candidates: HashMap<Vec<Value>, HashSet<Value>> = HashMap::new();
        for batch in ctx.input {
            for mut row in project(batch, &columns)? {
                let value = row.pop().unwrap_or(Value::Null);
                let group = candidates.entry(row).or_default();
                if !value.is_null() {
                    group.insert(value);
                }
            }
        }
        Ok(candidates)
    }
}

impl ResultVerifier for ArbitraryVerifier {
    fn supports_compare(&self) -> bool {
        false
    }

    fn supports_verify(&self) -> bool {
        true
    }

    fn compare(
        &self,
        _ctx: &VerificationContext<'_>,
        _result: &RowBatch,
        _other: &RowBatch,
    ) -> Result<(), String> {
        Ok(())
    }

    fn verify(&self, ctx: &VerificationContext<'_>, result: &RowBatch) -> Result<(), String> {
        let candidates = Self::candidates(ctx)?;
        let mut columns: Vec<&str> = ctx.keys.iter().map(String::as_str).collect();
        columns.push(ctx.output);
        for mut row in project(result, &columns)? {
            let value = row.pop().unwrap_or(Value::Null);
            let group = candidates.get(&row);
            match (&value, group) {
                // Global aggregation over empty input.
                (Value::Null, None) if ctx.keys.is_empty() => {}
                // An empty window frame yields null even for groups with values.
                (Value::Null, Some(values)) if values.is_empty() || ctx.window => {}
                (value, Some(values)) if values.contains(value) => {}
                (value, _) => {
                    return Err(format!(
                        "{} returned {value} which is not an input of group {row:?}",
                        ctx.function
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::types::DataType;

    fn batch(keys: Vec<Value>, values: Vec<Value>, ty: DataType) -> RowBatch {
        RowBatch::try_new(vec![
            Column::new("g0", DataType::BigInt, keys),
            Column::new("a0", ty, values),
        ])
        .unwrap()
    }

    fn ctx<'a>(
        input: &'a [RowBatch],
        keys: &'a [String],
        args: &'a [String],
    ) -> VerificationContext<'a> {
        VerificationContext {
            input,
            keys,
            function: "f",
            args,
            output: "a0",
            window: false,
        }
    }

    #[test]
    fn test_unordered_arrays() {
        let keys = ["g0".to_string()];
        let array = |items: &[i64]| Value::Array(items.iter().map(|i| Value::Int(*i)).collect());
        let ty = DataType::array(DataType::BigInt);
        let left = batch(
            vec![Value::Int(1), Value::Int(2)],
            vec![array(&[1, 2, 3]), array(&[4])],
            ty.clone(),
        );
        let right = batch(
            vec![Value::Int(2), Value::Int(1)],
            vec![array(&[4]), array(&[3, 1, 2])],
            ty.clone(),
        );
        let verifier = UnorderedArrayVerifier;
        let ctx = ctx(&[], &keys, &[]);
        assert!(verifier.compare(&ctx, &left, &right).is_ok());

        let wrong = batch(
            vec![Value::Int(2), Value::Int(1)],
            vec![array(&[4]), array(&[3, 1])],
            ty,
        );
        assert!(verifier.compare(&ctx, &left, &wrong).is_err());
    }

    #[test]
    fn test_arbitrary() {
        let keys = ["g0".to_string()];
        let args = ["c0".to_string()];
        let input = [RowBatch::try_new(vec![
            Column::new(
                "g0",
                DataType::BigInt,
                vec![Value::Int(1), Value::Int(1), Value::Int(2)],
            ),
            Column::new(
                "c0",
                DataType::BigInt,
                vec![Value::Int(10), Value::Int(11), Value::Null],
            ),
        ])
        .unwrap()];
        let verifier = ArbitraryVerifier;
        let good = batch(
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(11), Value::Null],
            DataType::BigInt,
        );
        assert!(verifier.verify(&ctx(&input, &keys, &args), &good).is_ok());
        let bad = batch(
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(12), Value::Null],
            DataType::BigInt,
        );
        assert!(verifier.verify(&ctx(&input, &keys, &args), &bad).is_err());
    }
}
