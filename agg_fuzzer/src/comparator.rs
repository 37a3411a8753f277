//! Result comparison between plan variants and the reference.

use std::sync::Arc;

use itertools::Itertools;

use crate::batch::RowBatch;
use crate::executor::Outcome;
use crate::types::Value;
use crate::verifier::{ResultVerifier, VerificationContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonResult {
    Match,
    Mismatch { reason: String },
}

impl ComparisonResult {
    pub fn is_match(&self) -> bool {
        matches!(self, ComparisonResult::Match)
    }

    pub fn mismatch(reason: impl Into<String>) -> Self {
        ComparisonResult::Mismatch {
            reason: reason.into(),
        }
    }
}

/// How two successful results are compared.
#[derive(Clone, Copy)]
pub struct CompareMode<'a> {
    /// Row order is significant, e.g. for plans rooted at an ORDER BY.
    pub ordered: bool,
    /// Only compare row counts, then defer to the verifiers.
    pub custom_verification: bool,
    pub verifiers: &'a [Arc<dyn ResultVerifier>],
    pub context: Option<VerificationContext<'a>>,
}

impl Default for CompareMode<'_> {
    fn default() -> Self {
        Self {
            ordered: false,
            custom_verification: false,
            verifiers: &[],
            context: None,
        }
    }
}

pub struct Comparator;

impl Comparator {
    /// Compares `actual` against `expected`. Neither input is modified.
    pub fn compare(
        actual: &Outcome,
        expected: &Outcome,
        mode: CompareMode<'_>,
    ) -> ComparisonResult {
        match (actual, expected) {
            (Outcome::Failure { .. }, Outcome::Failure { .. }) => ComparisonResult::Match,
            (Outcome::Failure { message, .. }, Outcome::Success(_)) => {
                ComparisonResult::mismatch(format!("expected success but failed: {message}"))
            }
            (Outcome::Success(_), Outcome::Failure { message, .. }) => ComparisonResult::mismatch(
                format!("expected failure ({message}) but succeeded"),
            ),
            (Outcome::Success(actual), Outcome::Success(expected)) => {
                Self::compare_batches(actual, expected, mode)
            }
        }
    }

    pub fn compare_batches(
        actual: &RowBatch,
        expected: &RowBatch,
        mode: CompareMode<'_>,
    ) -> ComparisonResult {
        if actual.num_rows() != expected.num_rows() {
            return ComparisonResult::mismatch(format!(
                "row count mismatch: {} vs {} expected",
                actual.num_rows(),
                expected.num_rows()
            ));
        }
        if mode.custom_verification {
            return Self::run_verifiers(actual, expected, mode);
        }
        if actual.num_columns() != expected.num_columns() {
            return ComparisonResult::mismatch(format!(
                "column count mismatch: {} vs {} expected",
                actual.num_columns(),
                expected.num_columns()
            ));
        }
        let mut left = actual.rows();
        let mut right = expected.rows();
        if mode.ordered {
            let position = left
                .iter()
                .zip(&right)
                .position(|(l, r)| !rows_approximately_equal(l, r));
            return match position {
                None => ComparisonResult::Match,
                Some(i) => {
                    print_diff(&left, &right, "actual", "expected");
                    ComparisonResult::mismatch(format!(
                        "row {i} differs: {} vs {} expected",
                        format_row(&left[i]),
                        format_row(&right[i])
                    ))
                }
            };
        }
        left.sort();
        right.sort();
        match unmatched_row(&left, &right) {
            None => ComparisonResult::Match,
            Some(i) => {
                print_diff(&left, &right, "actual", "expected");
                ComparisonResult::mismatch(format!(
                    "row {} has no match in expected",
                    format_row(&left[i])
                ))
            }
        }
    }

    fn run_verifiers(
        actual: &RowBatch,
        expected: &RowBatch,
        mode: CompareMode<'_>,
    ) -> ComparisonResult {
        let Some(ctx) = mode.context else {
            return ComparisonResult::Match;
        };
        for verifier in mode.verifiers {
            let checked = if verifier.supports_compare() {
                verifier.compare(&ctx, actual, expected)
            } else if verifier.supports_verify() {
                verifier.verify(&ctx, actual)
            } else {
                Ok(())
            };
            if let Err(reason) = checked {
                return ComparisonResult::mismatch(format!(
                    "{} verification failed: {reason}",
                    ctx.function
                ));
            }
        }
        ComparisonResult::Match
    }
}

fn rows_approximately_equal(left: &[Value], right: &[Value]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.approx_eq(r))
}

/// Pairs every row of `left` with an approximately equal, not yet used row
/// of `right`. Both sides are sorted, so the pairing is usually positional.
/// Doubles within tolerance may sort apart, hence the search fallback.
fn unmatched_row(left: &[Vec<Value>], right: &[Vec<Value>]) -> Option<usize> {
    if left
        .iter()
        .zip(right)
        .all(|(l, r)| rows_approximately_equal(l, r))
    {
        return None;
    }
    let mut used = vec![false; right.len()];
    for (i, row) in left.iter().enumerate() {
        let candidate =
            (0..right.len()).find(|&j| !used[j] && rows_approximately_equal(row, &right[j]));
        match candidate {
            Some(j) => used[j] = true,
            None => return Some(i),
        }
    }
    None
}

fn format_row(row: &[Value]) -> String {
    format!("({})", row.iter().join(", "))
}

/// Logs a line diff of two row sets.
pub fn print_diff(
    left: &[Vec<Value>],
    right: &[Vec<Value>],
    left_label: &str,
    right_label: &str,
) {
    let left: Vec<String> = left.iter().map(|row| format_row(row)).collect();
    let right: Vec<String> = right.iter().map(|row| format_row(row)).collect();
    let left = format!("{left:#?}");
    let right = format!("{right:#?}");
    let diff = similar_asserts::SimpleDiff::from_str(&left, &right, left_label, right_label);
    tracing::error!(%diff);
}
