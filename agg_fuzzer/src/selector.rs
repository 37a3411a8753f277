//! Uniform signature selection with per-slot run and failure counters.

use rand::Rng;

use crate::catalog::SignatureCatalog;
use crate::error::{FuzzerError, Result};
use crate::signature::CallableSignature;
use crate::types::DataType;

/// Per-slot counters. They only ever grow during a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignatureStats {
    pub num_runs: usize,
    pub num_failed: usize,
}

/// Index of a catalog slot: concrete signatures first, then templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureSlot(pub usize);

#[derive(Debug)]
pub struct SignatureSelector {
    catalog: SignatureCatalog,
    supported_key_types: Vec<DataType>,
    max_num_varargs: usize,
    stats: Vec<SignatureStats>,
}

impl SignatureSelector {
    pub fn new(
        catalog: SignatureCatalog,
        supported_key_types: Vec<DataType>,
        max_num_varargs: usize,
    ) -> Result<Self> {
        if catalog.is_empty() {
            return Err(FuzzerError::EmptyCatalog);
        }
        if !catalog.templates().is_empty() && supported_key_types.is_empty() {
            return Err(FuzzerError::NoKeyTypes);
        }
        let stats = vec![SignatureStats::default(); catalog.len()];
        Ok(Self {
            catalog,
            supported_key_types,
            max_num_varargs,
            stats,
        })
    }

    pub fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    pub fn supported_key_types(&self) -> &[DataType] {
        &self.supported_key_types
    }

    /// Picks a slot with a single uniform draw and resolves it into a
    /// callable signature. The slot's run counter is bumped before returning.
    pub fn pick(&mut self, rng: &mut impl Rng) -> Result<(CallableSignature, SignatureSlot)> {
        let index = rng.random_range(0..self.catalog.len());
        let num_concrete = self.catalog.signatures().len();
        let signature = if index < num_concrete {
            self.catalog.signatures()[index].clone()
        } else {
            let template = &self.catalog.templates()[index - num_concrete];
            template
                .resolve(&self.supported_key_types, rng)
                .ok_or(FuzzerError::NoKeyTypes)?
        };
        let signature = signature.with_random_varargs(self.max_num_varargs, rng);
        self.stats[index].num_runs += 1;
        Ok((signature, SignatureSlot(index)))
    }

    pub fn record_failure(&mut self, slot: SignatureSlot) {
        self.stats[slot.0].num_failed += 1;
    }

    pub fn stats(&self, slot: SignatureSlot) -> SignatureStats {
        self.stats[slot.0]
    }

    pub fn signature_stats(&self) -> &[SignatureStats] {
        &self.stats
    }

    pub fn describe(&self, slot: SignatureSlot) -> String {
        let num_concrete = self.catalog.signatures().len();
        if slot.0 < num_concrete {
            self.catalog.signatures()[slot.0].to_string()
        } else {
            self.catalog.templates()[slot.0 - num_concrete].to_string()
        }
    }

    /// Logs every slot that failed in at least half of its runs.
    pub fn print_signature_stats(&self) {
        let mut num_reported = 0;
        for (index, stats) in self.stats.iter().enumerate() {
            if stats.num_runs == 0 || stats.num_failed * 2 < stats.num_runs {
                continue;
            }
            num_reported += 1;
            tracing::info!(
                "{}: {} failed out of {} runs ({:.2}%)",
                self.describe(SignatureSlot(index)),
                stats.num_failed,
                stats.num_runs,
                stats.num_failed as f64 * 100.0 / stats.num_runs as f64
            );
        }
        if num_reported == 0 {
            tracing::info!("No signature failed in at least half of its runs");
        }
    }
}
