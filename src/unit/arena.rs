//! Unit record storage
//!
//! Units refer to their parent by index rather than by pointer. Records stay
//! readable after their unit completes, so ancestor walks pass through
//! finished units. An arena belongs to one unit tree, i.e. one benchmark
//! round, and is freed with it.

use super::UnitRecord;
use std::sync::{Arc, PoisonError, RwLock};

/// Index of a unit record in its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(usize);

/// Shared table of the unit records of one run
#[derive(Debug, Default)]
pub struct Arena {
    records: RwLock<Vec<Arc<UnitRecord>>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and return its id
    pub(crate) fn insert(&self, build: impl FnOnce(UnitId) -> UnitRecord) -> Arc<UnitRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = UnitId(records.len());
        let record = Arc::new(build(id));
        records.push(Arc::clone(&record));
        record
    }

    /// Record for `id`
    pub(crate) fn get(&self, id: UnitId) -> Option<Arc<UnitRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(id.0).cloned()
    }

    /// Number of units created in this tree
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
