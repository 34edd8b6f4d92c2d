use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metrics::bucket::{Bucket, Key};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket not found")]
    NotFound,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory bucket store. One mutex guards the map; holders never do
/// I/O under it. The clock is injectable so scan-eligibility tests can
/// pin time.
pub struct MemStore {
    buckets: Mutex<HashMap<Key, Bucket>>,
    clock: Clock,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_clock(Box::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Merge the bucket's vals into the resident cell with the same
    /// identity, creating it when absent.
    pub fn put(&self, b: Bucket) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        match buckets.get_mut(&b.id.key()) {
            Some(resident) => resident.vals.extend_from_slice(&b.vals),
            None => {
                buckets.insert(b.id.key(), b);
            }
        }
    }

    /// Destructive read: move the resident cell's vals into `b` and
    /// drop the entry.
    pub fn get(&self, b: &mut Bucket) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let resident = buckets.remove(&b.id.key()).ok_or(StoreError::NotFound)?;
        b.vals = resident.vals;
        Ok(())
    }

    /// Snapshot of every cell whose window has closed by `now`
    /// (`time + resolution <= now`). The returned buckets carry ids
    /// only; `get` drains the vals.
    pub fn scan(&self, now: DateTime<Utc>) -> Vec<Bucket> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .values()
            .filter(|b| b.id.ready_at() <= now)
            .map(|b| Bucket::new(b.id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
