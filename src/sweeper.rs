//! # Maintenance Sweeper
//!
//! Long-lived background task that reclaims space consumed by expired
//! records, independent of request traffic. Each tick runs one sweep pass
//! with bounded retries; a failed tick is logged and retried on the next
//! one, never in a tight loop.

use crate::store::BucketStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_ATTEMPTS_PER_TICK: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Spawns and owns the periodic maintenance task.
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweeper on the current tokio runtime.
    ///
    /// The task wakes every `interval`, runs the store's sweep on the
    /// blocking pool, and keeps going until the handle shuts it down.
    pub fn spawn(store: Arc<dyn BucketStore>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of tokio's interval fires immediately; skip it
            // so a freshly started service does not sweep on boot.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_tick(&store).await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

async fn run_tick(store: &Arc<dyn BucketStore>) {
    for attempt in 1..=MAX_ATTEMPTS_PER_TICK {
        let store = Arc::clone(store);
        let now = OffsetDateTime::now_utc();
        let result = tokio::task::spawn_blocking(move || store.sweep(now)).await;

        match result {
            Ok(Ok(stats)) => {
                tracing::debug!(
                    buckets_scanned = stats.buckets_scanned,
                    records_dropped = stats.records_dropped,
                    buckets_deleted = stats.buckets_deleted,
                    "sweep pass complete"
                );
                return;
            }
            Ok(Err(err)) if attempt < MAX_ATTEMPTS_PER_TICK => {
                tracing::warn!(error = %err, attempt, "sweep attempt failed, backing off");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "sweep failed, will retry next tick");
                return;
            }
            Err(join_err) => {
                tracing::warn!(error = %join_err, "sweep task panicked, will retry next tick");
                return;
            }
        }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper cooperatively and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Abort the task without waiting. Safe because a sweep pass never
    /// leaves a bucket half-written.
    pub fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkerTuning;
    use crate::model::{BucketKey, Fingerprint};
    use crate::store::MemoryStore;

    fn canvas_fp(hash: &str) -> Fingerprint {
        Fingerprint {
            canvas: hash.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sweeper_reclaims_expired_buckets() {
        let tuning = LinkerTuning {
            ttl: time::Duration::milliseconds(50),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(tuning));

        let now = OffsetDateTime::now_utc();
        store.resolve(
            &BucketKey::new("b1".to_string()),
            "v1",
            &canvas_fp("c0ffee00deadbeef"),
            now,
            Duration::from_millis(250),
        );
        assert_eq!(store.bucket_count(), 1);

        let handle = Sweeper::spawn(store.clone(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.shutdown().await;

        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_task() {
        let store = Arc::new(MemoryStore::new(LinkerTuning::default()));
        let handle = Sweeper::spawn(store, Duration::from_secs(3600));
        // Must return promptly even though the interval is an hour
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
