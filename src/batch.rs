//! The data model a kernel moves between caches (spec ยง3 "Batch"/"CacheData").

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;

use crate::errors::Result;

/// An immutable columnar table. Batches move by ownership transfer between
/// kernels; nothing holds a batch mutably once it has been handed to a
/// `CacheMachine`.
pub type Batch = RecordBatch;

/// Where a `CacheData` handle's bytes currently live. Only `Host` is backed
/// by this crate -- the other tags exist so `materialize()` is exercised the
/// same way a spill-aware implementation would use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Device,
    Host,
    Disk,
}

/// An opaque, exactly-once-consumed handle to a `Batch`.
#[derive(Clone)]
pub struct CacheData {
    residency: Residency,
    batch: Arc<Batch>,
}

impl CacheData {
    pub fn from_batch(batch: Batch) -> Self {
        CacheData {
            residency: Residency::Host,
            batch: Arc::new(batch),
        }
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Materializes the handle into an owned `Batch`. Cheap for the `Host`
    /// backing this crate provides; a device/disk-backed implementation
    /// would copy or decompress here.
    pub fn materialize(&self) -> Result<Batch> {
        Ok(self.batch.as_ref().clone())
    }
}

impl std::fmt::Debug for CacheData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheData")
            .field("residency", &self.residency)
            .field("num_rows", &self.batch.num_rows())
            .finish()
    }
}
