//! # Persistent Bucket Store
//!
//! RocksDB-backed implementation of the bucket store. Each bucket is one
//! key whose value is a bincode envelope of the record list plus the
//! bucket's expiration clock. RocksDB has no per-key expiry, so retention
//! is simulated: reads filter expired payloads defensively and the
//! maintenance sweeper reclaims the space.

use crate::config::{LinkerTuning, StorageConfig};
use crate::linker;
use crate::model::{BucketKey, Fingerprint, IdentityRecord};
use crate::store::{BucketStore, Resolution, SweepStats};
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{BlockBasedOptions, Cache, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

const CF_BUCKETS: &str = "buckets";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const STORAGE_FORMAT_VERSION: u32 = 1;

const LOCK_STRIPES: usize = 64;
const DEFAULT_CACHE_CAPACITY: usize = 4_096;

#[derive(Debug, Serialize, Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Persisted representation of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketEnvelope {
    /// Whole-bucket expiration clock as unix seconds; refreshed on every write.
    expires_at: i64,
    records: Vec<IdentityRecord>,
}

impl BucketEnvelope {
    fn empty() -> Self {
        Self {
            expires_at: 0,
            records: Vec::new(),
        }
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now.unix_timestamp()
    }
}

/// RocksDB-backed bucket store.
///
/// Per-bucket serialization uses striped locks: a bucket key hashes to one
/// of a fixed set of mutexes, and the whole read-modify-write sequence for
/// that bucket runs under its stripe. The single `put` per resolve keeps
/// each write all-or-nothing.
pub struct PersistentStore {
    db: DB,
    locks: Vec<Mutex<()>>,
    cache: Mutex<LruCache<BucketKey, BucketEnvelope>>,
    tuning: LinkerTuning,
}

#[derive(Debug, Clone)]
pub struct PersistentOpenOptions {
    pub storage: StorageConfig,
    /// Capacity of the in-process decoded-bucket cache.
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>, tuning: LinkerTuning) -> Result<Self> {
        Self::open_with_options(path, tuning, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        tuning: LinkerTuning,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        let db = open_db(path, &options.storage)?;
        validate_or_init_manifest(&db)?;

        Ok(Self {
            db,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(options.cache_capacity.max(1)).expect("cache capacity"),
            )),
            tuning,
        })
    }

    fn stripe_index(&self, key: &BucketKey) -> usize {
        let mut hasher = rustc_hash::FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.locks.len()
    }

    fn buckets_cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_BUCKETS)
            .ok_or_else(|| anyhow!("missing buckets column family"))
    }

    /// Load a bucket's envelope. Corrupt payloads are treated as data loss
    /// and rebuilt from empty; only genuine IO errors propagate.
    fn load_bucket(&self, key: &BucketKey, now: OffsetDateTime) -> Result<BucketEnvelope> {
        if let Some(envelope) = self.cache.lock().get(key) {
            if envelope.is_expired(now) {
                return Ok(BucketEnvelope::empty());
            }
            return Ok(envelope.clone());
        }

        let cf = self.buckets_cf()?;
        let Some(bytes) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(BucketEnvelope::empty());
        };

        let envelope = match bincode::deserialize::<BucketEnvelope>(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "corrupt bucket payload, rebuilding from empty");
                BucketEnvelope::empty()
            }
        };

        if envelope.is_expired(now) {
            return Ok(BucketEnvelope::empty());
        }
        Ok(envelope)
    }

    fn save_bucket(&self, key: &BucketKey, envelope: &BucketEnvelope) -> Result<()> {
        let cf = self.buckets_cf()?;
        let bytes = bincode::serialize(envelope)?;
        self.db.put_cf(cf, key.as_bytes(), bytes)?;
        Ok(())
    }
}

impl BucketStore for PersistentStore {
    fn resolve(
        &self,
        key: &BucketKey,
        visitor_id: &str,
        fingerprint: &Fingerprint,
        now: OffsetDateTime,
        deadline: Duration,
    ) -> Resolution {
        let stripe = &self.locks[self.stripe_index(key)];
        let Some(_guard) = stripe.try_lock_for(deadline) else {
            tracing::debug!(deadline_ms = deadline.as_millis() as u64, "bucket lock wait exceeded deadline");
            return Resolution::default();
        };

        let mut envelope = match self.load_bucket(key, now) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "bucket read failed, skipping identity link");
                return Resolution::default();
            }
        };

        let linked = linker::link_observation(
            &mut envelope.records,
            visitor_id,
            fingerprint,
            now,
            &self.tuning,
        );
        envelope.expires_at = (now + self.tuning.ttl).unix_timestamp();

        if let Err(err) = self.save_bucket(key, &envelope) {
            tracing::warn!(error = %err, "bucket write failed, skipping identity link");
            self.cache.lock().pop(key);
            return Resolution::default();
        }
        self.cache.lock().put(key.clone(), envelope);

        Resolution {
            linked_visitor_id: linked,
        }
    }

    fn sweep(&self, now: OffsetDateTime) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        let keys: Vec<BucketKey> = {
            let cf = self.buckets_cf()?;
            self.db
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| item.map(|(k, _)| BucketKey::from_bytes(&k)))
                .collect::<Result<_, _>>()?
        };

        for key in keys {
            stats.buckets_scanned += 1;

            let stripe = &self.locks[self.stripe_index(&key)];
            let _guard = stripe.lock();

            let cf = self.buckets_cf()?;
            let Some(bytes) = self.db.get_cf(cf, key.as_bytes())? else {
                continue;
            };
            let envelope = match bincode::deserialize::<BucketEnvelope>(&bytes) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(error = %err, "corrupt bucket payload, deleting");
                    self.db.delete_cf(cf, key.as_bytes())?;
                    self.cache.lock().pop(&key);
                    stats.buckets_deleted += 1;
                    continue;
                }
            };

            if envelope.is_expired(now) {
                stats.records_dropped += envelope.records.len();
                stats.buckets_deleted += 1;
                self.db.delete_cf(cf, key.as_bytes())?;
                self.cache.lock().pop(&key);
                continue;
            }

            let ttl = self.tuning.ttl;
            let live: Vec<IdentityRecord> = envelope
                .records
                .iter()
                .filter(|r| !r.is_expired(now, ttl))
                .cloned()
                .collect();
            if live.len() < envelope.records.len() {
                stats.records_dropped += envelope.records.len() - live.len();
                // Rewrite without refreshing the expiration clock; a sweep
                // must never extend a bucket's retention.
                let pruned = BucketEnvelope {
                    expires_at: envelope.expires_at,
                    records: live,
                };
                self.save_bucket(&key, &pruned)?;
                self.cache.lock().put(key.clone(), pruned);
            }
        }

        if stats.buckets_deleted > 0 {
            let cf = self.buckets_cf()?;
            self.db
                .compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }

        Ok(stats)
    }

    fn bucket_records(&self, key: &BucketKey, now: OffsetDateTime) -> Vec<IdentityRecord> {
        let stripe = &self.locks[self.stripe_index(key)];
        let _guard = stripe.lock();

        match self.load_bucket(key, now) {
            Ok(envelope) => {
                let ttl = self.tuning.ttl;
                envelope
                    .records
                    .into_iter()
                    .filter(|r| !r.is_expired(now, ttl))
                    .collect()
            }
            Err(err) => {
                tracing::warn!(error = %err, "bucket read failed");
                Vec::new()
            }
        }
    }

    fn bucket_count(&self) -> usize {
        match self.buckets_cf() {
            Ok(cf) => self.db.iterator_cf(cf, IteratorMode::Start).count(),
            Err(_) => 0,
        }
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn open_db(path: impl AsRef<Path>, storage: &StorageConfig) -> Result<DB> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_write_buffer_size(storage.write_buffer_mb * 1024 * 1024);

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(storage.block_cache_mb * 1024 * 1024);
    block_opts.set_block_cache(&cache);
    opts.set_block_based_table_factory(&block_opts);

    let cf_descriptors = vec![
        ColumnFamilyDescriptor::new(CF_BUCKETS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&opts, path, cf_descriptors)?)
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;

    match db.get_cf(cf, KEY_MANIFEST)? {
        Some(bytes) => {
            let manifest: StorageManifest = bincode::deserialize(&bytes)
                .map_err(|err| anyhow!("unreadable storage manifest: {err}"))?;
            if manifest.format_version != STORAGE_FORMAT_VERSION {
                return Err(anyhow!(
                    "storage format version mismatch: found {}, expected {}",
                    manifest.format_version,
                    STORAGE_FORMAT_VERSION
                ));
            }
        }
        None => {
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            db.put_cf(cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn canvas_fp(hash: &str) -> Fingerprint {
        Fingerprint {
            canvas: hash.to_string(),
            ..Default::default()
        }
    }

    fn key(raw: &str) -> BucketKey {
        BucketKey::new(raw.to_string())
    }

    fn tuning() -> LinkerTuning {
        LinkerTuning {
            ttl: time::Duration::hours(1),
            ..Default::default()
        }
    }

    const DEADLINE: Duration = Duration::from_millis(250);

    #[test]
    fn test_resolve_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), tuning()).unwrap();

        let first = store.resolve(&key("b1"), "v1", &canvas_fp("c0ffee00deadbeef"), ts(100), DEADLINE);
        assert!(!first.is_match());

        let second = store.resolve(
            &key("b1"),
            "v2",
            &canvas_fp("c0ffee00deadbeee"),
            ts(200),
            DEADLINE,
        );
        assert_eq!(second.linked_visitor_id.as_deref(), Some("v1"));
        assert_eq!(store.bucket_records(&key("b1"), ts(200)).len(), 2);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = PersistentStore::open(dir.path(), tuning()).unwrap();
            store.resolve(&key("b1"), "v1", &canvas_fp("c0ffee00deadbeef"), ts(100), DEADLINE);
            store.flush().unwrap();
        }

        let store = PersistentStore::open(dir.path(), tuning()).unwrap();
        let resolution = store.resolve(
            &key("b1"),
            "v2",
            &canvas_fp("c0ffee00deadbeef"),
            ts(200),
            DEADLINE,
        );
        assert_eq!(resolution.linked_visitor_id.as_deref(), Some("v1"));
    }

    #[test]
    fn test_corrupt_payload_rebuilds_from_empty() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), tuning()).unwrap();

        let cf = store.db.cf_handle(CF_BUCKETS).unwrap();
        store
            .db
            .put_cf(cf, key("b1").as_bytes(), b"definitely not bincode")
            .unwrap();

        let resolution = store.resolve(
            &key("b1"),
            "v1",
            &canvas_fp("c0ffee00deadbeef"),
            ts(100),
            DEADLINE,
        );
        assert!(!resolution.is_match());
        // The corrupt payload was overwritten by a clean single-record bucket
        assert_eq!(store.bucket_records(&key("b1"), ts(100)).len(), 1);
    }

    #[test]
    fn test_expired_bucket_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), tuning()).unwrap();
        store.resolve(&key("b1"), "v1", &canvas_fp("c0ffee00deadbeef"), ts(100), DEADLINE);

        let later = ts(100 + 7_200);
        assert!(store.bucket_records(&key("b1"), later).is_empty());
        let resolution = store.resolve(
            &key("b1"),
            "v2",
            &canvas_fp("c0ffee00deadbeef"),
            later,
            DEADLINE,
        );
        assert!(!resolution.is_match());
    }

    #[test]
    fn test_sweep_reclaims_expired_buckets() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), tuning()).unwrap();
        store.resolve(&key("old"), "v1", &canvas_fp("c0ffee00deadbeef"), ts(100), DEADLINE);
        store.resolve(&key("live"), "v2", &canvas_fp("c0ffee00deadbeef"), ts(7_000), DEADLINE);

        let stats = store.sweep(ts(7_300)).unwrap();
        assert_eq!(stats.buckets_scanned, 2);
        assert_eq!(stats.buckets_deleted, 1);
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.bucket_records(&key("live"), ts(7_300)).len(), 1);
    }

    #[test]
    fn test_sweep_prunes_within_live_bucket() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), tuning()).unwrap();
        store.resolve(&key("b1"), "v1", &canvas_fp("c0ffee00deadbeef"), ts(100), DEADLINE);
        store.resolve(&key("b1"), "v2", &canvas_fp("1122334455667788"), ts(3_000), DEADLINE);

        let stats = store.sweep(ts(4_000)).unwrap();
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(stats.buckets_deleted, 0);
        let records = store.bucket_records(&key("b1"), ts(4_000));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].visitor_id, "v2");
    }

    #[test]
    fn test_manifest_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let store = PersistentStore::open(dir.path(), tuning()).unwrap();
            let cf = store.db.cf_handle(CF_METADATA).unwrap();
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION + 1,
                app_version: "test".to_string(),
            };
            store
                .db
                .put_cf(cf, KEY_MANIFEST, bincode::serialize(&manifest).unwrap())
                .unwrap();
        }

        assert!(PersistentStore::open(dir.path(), tuning()).is_err());
    }
}
