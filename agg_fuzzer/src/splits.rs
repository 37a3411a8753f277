//! Split files feeding table scans.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::batch::RowBatch;
use crate::error::Result;
use crate::memory::MemoryPool;

/// A file holding one input batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub path: PathBuf,
}

impl Split {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Writes batches into a scratch directory that lives as long as the writer.
#[derive(Debug)]
pub struct SplitWriter {
    dir: TempDir,
    pool: MemoryPool,
    num_written: usize,
}

impl SplitWriter {
    pub fn new(pool: MemoryPool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("agg_fuzzer_splits")
            .tempdir()?;
        Ok(Self {
            dir,
            pool,
            num_written: 0,
        })
    }

    pub fn directory(&self) -> &Path {
        self.dir.path()
    }

    /// Writes one split per batch.
    pub fn write(&mut self, batches: &[RowBatch]) -> Result<Vec<Split>> {
        let mut splits = Vec::with_capacity(batches.len());
        for batch in batches {
            let path = self
                .dir
                .path()
                .join(format!("split_{}.json", self.num_written));
            let encoded = serde_json::to_vec(batch)?;
            self.pool.reserve(encoded.len())?;
            let written = fs::write(&path, &encoded);
            self.pool.release(encoded.len())?;
            written?;
            self.num_written += 1;
            splits.push(Split::new(path));
        }
        tracing::debug!(
            "wrote {} splits to {}",
            splits.len(),
            self.dir.path().display()
        );
        Ok(splits)
    }
}

pub fn read_split(split: &Split) -> Result<RowBatch> {
    let bytes = fs::read(&split.path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::types::{DataType, Value};

    #[test]
    fn test_write_and_read_back() {
        let root = MemoryPool::root("test", None);
        let writer_pool = root.add_aggregate_child("writer").unwrap();
        let mut writer = SplitWriter::new(writer_pool.add_leaf_child("splits").unwrap()).unwrap();
        let batch = RowBatch::try_new(vec![Column::new(
            "c0",
            DataType::Double,
            vec![Value::Double(1.5), Value::Null, Value::Double(f64::INFINITY)],
        )])
        .unwrap();

        let splits = writer.write(&[batch.clone(), batch.clone()]).unwrap();
        assert_eq!(splits.len(), 2);
        assert_ne!(splits[0], splits[1]);
        assert_eq!(read_split(&splits[1]).unwrap(), batch);
        assert_eq!(root.used(), 0);
        assert!(root.peak() > 0);
    }
}
