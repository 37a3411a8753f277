//! Run statistics.

use std::collections::BTreeSet;

use crate::catalog::FunctionsStats;
use crate::reference::ReferenceResult;

/// Per-run counters, printed at the end of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzerStats {
    pub function_names: BTreeSet<String>,
    pub num_iterations: usize,
    pub num_sorted_inputs: usize,
    pub num_distinct_inputs: usize,
    pub num_window_queries: usize,
    pub num_verified: usize,
    pub num_verification_skipped: usize,
    pub num_reference_query_not_supported: usize,
    pub num_reference_query_failed: usize,
    pub num_failed: usize,
    /// Engine crashes and runtime errors.
    pub num_fatal_failures: usize,
    pub num_mismatches: usize,
}

impl FuzzerStats {
    pub fn num_defects(&self) -> usize {
        self.num_fatal_failures + self.num_mismatches
    }

    pub fn update_reference_query_stats(&mut self, result: &ReferenceResult) {
        match result {
            ReferenceResult::Rows(_) => {}
            ReferenceResult::Unsupported(_) => self.num_reference_query_not_supported += 1,
            ReferenceResult::Failed(_) => self.num_reference_query_failed += 1,
        }
    }

    pub fn print(&self) {
        let total = self.num_iterations;
        tracing::info!("Total functions tested: {}", self.function_names.len());
        tracing::info!("Total iterations: {total}");
        tracing::info!(
            "Total iterations requiring sorted inputs: {}",
            print_percentage_stat(self.num_sorted_inputs, total)
        );
        tracing::info!(
            "Total iterations using DISTINCT: {}",
            print_percentage_stat(self.num_distinct_inputs, total)
        );
        tracing::info!(
            "Total window queries: {}",
            print_percentage_stat(self.num_window_queries, total)
        );
        tracing::info!(
            "Total iterations verified against reference DB: {}",
            print_percentage_stat(self.num_verified, total)
        );
        tracing::info!(
            "Total not verified (skipped / unsupported / failed by reference DB): {} / {} / {}",
            print_percentage_stat(self.num_verification_skipped, total),
            print_percentage_stat(self.num_reference_query_not_supported, total),
            print_percentage_stat(self.num_reference_query_failed, total)
        );
        tracing::info!(
            "Total failed functions: {}",
            print_percentage_stat(self.num_failed, total)
        );
        tracing::info!(
            "Total engine crashes: {}",
            print_percentage_stat(self.num_fatal_failures, total)
        );
        tracing::info!(
            "Total mismatches: {}",
            print_percentage_stat(self.num_mismatches, total)
        );
    }
}

/// Formats `n` as a count and a share of `total`, e.g. `3 (1.50%)`.
pub fn print_percentage_stat(n: usize, total: usize) -> String {
    let percentage = if total == 0 {
        0.0
    } else {
        n as f64 * 100.0 / total as f64
    };
    format!("{n} ({percentage:.2}%)")
}

pub fn print_functions_stats(stats: &FunctionsStats) {
    tracing::info!(
        "Total functions: {} ({} signatures)",
        stats.num_functions,
        stats.num_signatures
    );
    tracing::info!(
        "Functions with at least one supported signature: {}",
        print_percentage_stat(stats.num_supported_functions, stats.num_functions)
    );
    tracing::info!(
        "Functions with no supported signature: {}",
        print_percentage_stat(
            stats.num_functions - stats.num_supported_functions.min(stats.num_functions),
            stats.num_functions
        )
    );
    tracing::info!(
        "Supported function signatures: {}",
        print_percentage_stat(stats.num_supported_signatures, stats.num_signatures)
    );
    tracing::info!(
        "Unsupported function signatures: {}",
        print_percentage_stat(
            stats.num_signatures - stats.num_supported_signatures.min(stats.num_signatures),
            stats.num_signatures
        )
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_stat() {
        assert_eq!(print_percentage_stat(3, 200), "3 (1.50%)");
        assert_eq!(print_percentage_stat(0, 0), "0 (0.00%)");
        assert_eq!(print_percentage_stat(5, 5), "5 (100.00%)");
    }

    #[test]
    fn test_reference_stats() {
        let mut stats = FuzzerStats::default();
        stats.update_reference_query_stats(&ReferenceResult::Unsupported("x".to_string()));
        stats.update_reference_query_stats(&ReferenceResult::Failed("y".to_string()));
        stats.update_reference_query_stats(&ReferenceResult::Failed("z".to_string()));
        assert_eq!(stats.num_reference_query_not_supported, 1);
        assert_eq!(stats.num_reference_query_failed, 2);
    }
}
