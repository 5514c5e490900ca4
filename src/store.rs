//! # Bucketed Identity Store
//!
//! Keyed storage mapping a bucket key to the bounded list of recently seen
//! identity observations. Owns concurrency control and TTL semantics:
//! operations on the same bucket key are strictly serialized, operations on
//! different keys are fully independent.

use crate::config::LinkerTuning;
use crate::linker;
use crate::model::{BucketKey, Fingerprint, IdentityRecord};
use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Outcome of a resolve call. A failed or timed-out call degrades to
/// "no match" rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Previously seen visitor id this observation was linked to, if any.
    pub linked_visitor_id: Option<String>,
}

impl Resolution {
    pub fn is_match(&self) -> bool {
        self.linked_visitor_id.is_some()
    }
}

/// Counters reported by one maintenance sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub buckets_scanned: usize,
    pub records_dropped: usize,
    pub buckets_deleted: usize,
}

/// Storage contract for the resolution cache.
///
/// `resolve` executes the whole read-filter-match-append-persist sequence as
/// one atomic unit per bucket key. Callers never retain references into the
/// store; every call receives and returns copies.
pub trait BucketStore: Send + Sync {
    /// Atomically link the current observation into its bucket.
    ///
    /// `deadline` bounds how long the call may wait on the bucket's lock;
    /// on expiry the call fails closed (no match, nothing written).
    fn resolve(
        &self,
        key: &BucketKey,
        visitor_id: &str,
        fingerprint: &Fingerprint,
        now: OffsetDateTime,
        deadline: Duration,
    ) -> Resolution;

    /// Drop expired records and delete buckets left empty. Holds at most one
    /// bucket's lock at a time.
    fn sweep(&self, now: OffsetDateTime) -> Result<SweepStats>;

    /// Copy of a bucket's live records (expired entries filtered).
    fn bucket_records(&self, key: &BucketKey, now: OffsetDateTime) -> Vec<IdentityRecord>;

    /// Number of buckets currently held.
    fn bucket_count(&self) -> usize;

    /// Flush any buffered state to durable storage, when applicable.
    fn flush(&self) -> Result<()>;
}

#[derive(Debug)]
struct StoredBucket {
    /// Whole-bucket expiration clock, refreshed to `now + ttl` on every write.
    expires_at: OffsetDateTime,
    records: Vec<IdentityRecord>,
}

type BucketCell = Arc<Mutex<StoredBucket>>;

/// In-memory bucket store.
///
/// Buckets live in a concurrent map; each bucket carries its own mutex, so
/// the map's shard locks are only held long enough to clone the cell out.
pub struct MemoryStore {
    buckets: DashMap<BucketKey, BucketCell>,
    tuning: LinkerTuning,
}

impl MemoryStore {
    pub fn new(tuning: LinkerTuning) -> Self {
        Self {
            buckets: DashMap::new(),
            tuning,
        }
    }

    fn cell(&self, key: &BucketKey, now: OffsetDateTime) -> BucketCell {
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(StoredBucket {
                    expires_at: now + self.tuning.ttl,
                    records: Vec::new(),
                }))
            })
            .clone()
    }
}

impl BucketStore for MemoryStore {
    fn resolve(
        &self,
        key: &BucketKey,
        visitor_id: &str,
        fingerprint: &Fingerprint,
        now: OffsetDateTime,
        deadline: Duration,
    ) -> Resolution {
        let cell = self.cell(key, now);
        let mut bucket = match cell.try_lock_for(deadline) {
            Some(guard) => guard,
            None => {
                tracing::debug!(deadline_ms = deadline.as_millis() as u64, "bucket lock wait exceeded deadline");
                return Resolution::default();
            }
        };

        // The map's native expiry is the sweeper; filter defensively here in
        // case the whole bucket outlived its retention between sweeps.
        if bucket.expires_at <= now {
            bucket.records.clear();
        }

        let linked =
            linker::link_observation(&mut bucket.records, visitor_id, fingerprint, now, &self.tuning);
        bucket.expires_at = now + self.tuning.ttl;

        Resolution {
            linked_visitor_id: linked,
        }
    }

    fn sweep(&self, now: OffsetDateTime) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let keys: Vec<BucketKey> = self.buckets.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            let Some(cell) = self.buckets.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            stats.buckets_scanned += 1;

            let emptied = {
                let mut bucket = cell.lock();
                let before = bucket.records.len();
                if bucket.expires_at <= now {
                    bucket.records.clear();
                } else {
                    let ttl = self.tuning.ttl;
                    bucket.records.retain(|r| !r.is_expired(now, ttl));
                }
                stats.records_dropped += before - bucket.records.len();
                bucket.records.is_empty()
            };
            // Release our own clone so the strong-count check below only
            // sees the map's reference plus any live resolver's.
            drop(cell);

            if emptied {
                // strong_count == 1 means no resolver holds the cell; cloning
                // requires the shard lock held by remove_if, so the check
                // cannot race with a new resolver.
                let removed = self.buckets.remove_if(&key, |_, cell| {
                    Arc::strong_count(cell) == 1 && cell.lock().records.is_empty()
                });
                if removed.is_some() {
                    stats.buckets_deleted += 1;
                }
            }
        }

        Ok(stats)
    }

    fn bucket_records(&self, key: &BucketKey, now: OffsetDateTime) -> Vec<IdentityRecord> {
        let Some(cell) = self.buckets.get(key).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let bucket = cell.lock();
        if bucket.expires_at <= now {
            return Vec::new();
        }
        let ttl = self.tuning.ttl;
        bucket
            .records
            .iter()
            .filter(|r| !r.is_expired(now, ttl))
            .cloned()
            .collect()
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
