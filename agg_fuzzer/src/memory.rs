//! Hierarchical memory accounting.
//!
//! Pools form a tree. Only leaf pools accept reservations; a reservation is
//! charged to the leaf and every ancestor, so the root always reflects the
//! total footprint of the run. Each iteration releases what it reserved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{FuzzerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Aggregate,
    Leaf,
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    kind: PoolKind,
    capacity: Option<usize>,
    parent: Option<Arc<PoolInner>>,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let used = self.used.load(Ordering::Relaxed);
        if used > 0 {
            tracing::warn!(
                "memory pool `{}` dropped with {used} bytes still reserved",
                self.name
            );
        }
    }
}

/// Handle to a node in the memory pool tree. Cloning shares the node.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Creates a root aggregate pool, optionally bounded.
    pub fn root(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self::with_parent(name.into(), PoolKind::Aggregate, capacity, None)
    }

    fn with_parent(
        name: String,
        kind: PoolKind,
        capacity: Option<usize>,
        parent: Option<Arc<PoolInner>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                kind,
                capacity,
                parent,
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    fn add_child(&self, name: impl Into<String>, kind: PoolKind) -> Result<MemoryPool> {
        if self.inner.kind != PoolKind::Aggregate {
            return Err(FuzzerError::Memory {
                pool: self.inner.name.clone(),
                reason: "cannot add a child to a leaf pool".to_string(),
            });
        }
        let name = format!("{}.{}", self.inner.name, name.into());
        Ok(Self::with_parent(name, kind, None, Some(self.inner.clone())))
    }

    pub fn add_leaf_child(&self, name: impl Into<String>) -> Result<MemoryPool> {
        self.add_child(name, PoolKind::Leaf)
    }

    pub fn add_aggregate_child(&self, name: impl Into<String>) -> Result<MemoryPool> {
        self.add_child(name, PoolKind::Aggregate)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Relaxed)
    }

    fn ancestors(&self) -> impl Iterator<Item = &PoolInner> {
        std::iter::successors(Some(self.inner.as_ref()), |&pool| pool.parent.as_deref())
    }

    pub fn reserve(&self, bytes: usize) -> Result<()> {
        if self.inner.kind != PoolKind::Leaf {
            return Err(FuzzerError::Memory {
                pool: self.inner.name.clone(),
                reason: "reservations are only allowed on leaf pools".to_string(),
            });
        }
        for pool in self.ancestors() {
            if let Some(capacity) = pool.capacity {
                let used = pool.used.load(Ordering::Relaxed);
                if used + bytes > capacity {
                    return Err(FuzzerError::Memory {
                        pool: pool.name.clone(),
                        reason: format!(
                            "cannot reserve {bytes} bytes, {used} of {capacity} in use"
                        ),
                    });
                }
            }
        }
        for pool in self.ancestors() {
            let used = pool.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
            pool.peak.fetch_max(used, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn release(&self, bytes: usize) -> Result<()> {
        let used = self.used();
        if bytes > used {
            return Err(FuzzerError::Memory {
                pool: self.inner.name.clone(),
                reason: format!("released {bytes} bytes but only {used} are reserved"),
            });
        }
        for pool in self.ancestors() {
            pool.used.fetch_sub(bytes, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Releases everything this pool holds.
    pub fn release_all(&self) -> Result<()> {
        self.release(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_propagates() {
        let root = MemoryPool::root("fuzzer", None);
        let leaf = root.add_leaf_child("leaf").unwrap();
        let writer = root.add_aggregate_child("writer").unwrap();
        let writer_leaf = writer.add_leaf_child("splits").unwrap();

        leaf.reserve(100).unwrap();
        writer_leaf.reserve(40).unwrap();
        assert_eq!(leaf.used(), 100);
        assert_eq!(writer.used(), 40);
        assert_eq!(root.used(), 140);

        leaf.release_all().unwrap();
        writer_leaf.release(40).unwrap();
        assert_eq!(root.used(), 0);
        assert_eq!(root.peak(), 140);
    }

    #[test]
    fn test_aggregate_pool_rejects_reservation() {
        let root = MemoryPool::root("fuzzer", None);
        assert!(root.reserve(1).is_err());
        let leaf = root.add_leaf_child("leaf").unwrap();
        assert!(leaf.add_leaf_child("nested").is_err());
    }

    #[test]
    fn test_capacity() {
        let root = MemoryPool::root("fuzzer", Some(64));
        let leaf = root.add_leaf_child("leaf").unwrap();
        leaf.reserve(60).unwrap();
        assert!(leaf.reserve(10).is_err());
        assert_eq!(root.used(), 60);
        assert!(leaf.release(61).is_err());
        leaf.release(60).unwrap();
    }
}
