//! # idstitch
//!
//! Short-horizon visitor identity resolution for pseudo-anonymous telemetry.
//!
//! This library decides whether a newly observed tracking event should be
//! re-labeled with a previously seen visitor's identifier, so downstream
//! analytics see one continuous identity instead of fragmented sessions
//! (cross-domain navigation, private-browsing resets, cookie loss). It is a
//! best-effort linker: matching is fuzzy, bounded by a retention window, and
//! scoped to a coarse device bucket.

pub mod config;
pub mod extract;
pub mod linker;
pub mod model;
pub mod persistence;
pub mod similarity;
pub mod store;
pub mod sweeper;

// Re-export main types for convenience
pub use config::{ConfigOverrides, LinkerTuning, StitchConfig};
pub use model::{BucketKey, Fingerprint, IdentityRecord};
pub use persistence::{PersistentOpenOptions, PersistentStore};
pub use store::{BucketStore, MemoryStore, Resolution, SweepStats};
pub use sweeper::{Sweeper, SweeperHandle};

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

/// Main API for identity resolution.
///
/// Owns the bucket store and composes signal extraction, fuzzy matching,
/// and the transactional bucket update. This is the only entry point the
/// ingestion pipeline uses; bucket keys and fingerprint internals never
/// leave this boundary.
pub struct Identifier {
    store: Arc<dyn BucketStore>,
    tuning: LinkerTuning,
}

impl Identifier {
    /// Create an identifier over an explicit store instance.
    pub fn new(store: Arc<dyn BucketStore>, tuning: LinkerTuning) -> Self {
        Self { store, tuning }
    }

    /// Create an identifier backed by the in-memory store.
    pub fn in_memory(tuning: LinkerTuning) -> Self {
        let store = Arc::new(MemoryStore::new(tuning.clone()));
        Self { store, tuning }
    }

    /// Create an identifier backed by persistent storage at `path`.
    pub fn open(path: impl AsRef<Path>, tuning: LinkerTuning) -> anyhow::Result<Self> {
        let store = Arc::new(PersistentStore::open(path, tuning.clone())?);
        Ok(Self { store, tuning })
    }

    /// Create an identifier from a loaded configuration: persistent when a
    /// data directory is configured, in-memory otherwise.
    pub fn from_config(config: &StitchConfig) -> anyhow::Result<Self> {
        let tuning = config.tuning()?;
        match &config.data_dir {
            Some(dir) => {
                let store = Arc::new(PersistentStore::open_with_options(
                    dir,
                    tuning.clone(),
                    PersistentOpenOptions {
                        storage: config.storage.clone(),
                        ..Default::default()
                    },
                )?);
                Ok(Self { store, tuning })
            }
            None => Ok(Self::in_memory(tuning)),
        }
    }

    /// Check whether this event matches a recently seen visitor.
    ///
    /// Returns the previously established visitor id when a link is found;
    /// the caller is expected to overwrite the event's visitor identifier
    /// with it before further processing. Returns `None` when the event
    /// carries too little signal, no candidate qualifies, or the store
    /// degrades (IO failure, deadline); a missed link is never an error.
    pub fn identify(&self, event: &Value) -> Option<String> {
        self.identify_at(event, OffsetDateTime::now_utc())
    }

    /// `identify` against an explicit clock, for deterministic callers.
    pub fn identify_at(&self, event: &Value, now: OffsetDateTime) -> Option<String> {
        let signals = extract::extract(event)?;
        let resolution = self.store.resolve(
            &signals.bucket_key,
            &signals.visitor_id,
            &signals.fingerprint,
            now,
            self.tuning.resolve_deadline,
        );
        resolution.linked_visitor_id
    }

    /// Spawn the maintenance sweeper for this identifier's store on the
    /// current tokio runtime, using the configured sweep interval.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        Sweeper::spawn(Arc::clone(&self.store), self.tuning.sweep_interval)
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> Arc<dyn BucketStore> {
        Arc::clone(&self.store)
    }

    /// The tuning this identifier operates with.
    pub fn tuning(&self) -> &LinkerTuning {
        &self.tuning
    }
}
