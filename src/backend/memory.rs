//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{storage_key, Backend};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::Interval;

/// On average one increment in this many triggers a sweep of expired slots.
const SWEEP_ONE_IN: u32 = 100;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at_ms: u64,
}

/// Counter store for a single process.
///
/// Slots live in a sharded map; the increment runs under the shard's write
/// lock, which makes it atomic for all callers on the same key. Expired slots
/// are dropped by [`MemoryBackend::sweep`], which also runs randomly on the
/// hot path and can be scheduled with [`MemoryBackend::spawn_sweeper`].
pub struct MemoryBackend {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Create a backend driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a backend driven by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Remove every expired slot, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at_ms > now);
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed, remaining = self.slots.len(), "Swept expired counters");
        }
        removed
    }

    /// Sweep expired slots every `every` on the current tokio runtime.
    ///
    /// The task holds a weak reference and exits once the backend is dropped.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let backend = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match backend.upgrade() {
                    Some(backend) => {
                        backend.sweep();
                    }
                    None => break,
                }
            }
            trace!("Memory backend dropped, sweeper stopped");
        })
    }

    /// Count recorded for `key` in the current bucket of `interval`.
    pub fn current_count(&self, key: &str, interval: Interval) -> u64 {
        let now = self.clock.now_ms();
        let storage_key = storage_key(key, interval, interval.bucket_of(now));
        self.slots
            .get(&storage_key)
            .filter(|slot| slot.expires_at_ms > now)
            .map(|slot| slot.count)
            .unwrap_or(0)
    }

    /// Number of stored slots, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_and_increment(&self, storage_key: &str, ttl: Duration) -> Result<u64> {
        let sweep = rand::thread_rng().gen_ratio(1, SWEEP_ONE_IN);
        if sweep {
            self.sweep();
        }

        let now = self.clock.now_ms();
        let mut slot = self
            .slots
            .entry(storage_key.to_string())
            .or_insert_with(|| {
                trace!(key = %storage_key, "Creating counter");
                Slot {
                    count: 0,
                    expires_at_ms: now + ttl.as_millis() as u64,
                }
            });
        slot.count += 1;
        Ok(slot.count)
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::TimeUnit;

    const START_MS: u64 = 1_728_000_000_000;

    fn backend() -> (Arc<ManualClock>, MemoryBackend) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = MemoryBackend::with_clock(clock.clone());
        (clock, backend)
    }

    #[tokio::test]
    async fn test_increment_counts_per_key() {
        let (_, backend) = backend();
        let ttl = Duration::from_secs(60);

        assert_eq!(backend.get_and_increment("a", ttl).await.unwrap(), 1);
        assert_eq!(backend.get_and_increment("a", ttl).await.unwrap(), 2);
        assert_eq!(backend.get_and_increment("b", ttl).await.unwrap(), 1);
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_window_rollover_starts_fresh_counter() {
        let (clock, backend) = backend();
        let interval = Interval::per(TimeUnit::Minute);

        for _ in 0..3 {
            backend.process("login@host=1.2.3.4", interval, 3).await.unwrap();
        }
        let status = backend.process("login@host=1.2.3.4", interval, 3).await.unwrap();
        assert!(status.is_violation());
        assert_eq!(backend.current_count("login@host=1.2.3.4", interval), 4);

        clock.advance(Duration::from_secs(60));

        assert_eq!(backend.current_count("login@host=1.2.3.4", interval), 0);
        let status = backend.process("login@host=1.2.3.4", interval, 3).await.unwrap();
        assert!(!status.is_violation());
        assert_eq!(status.meta.requests_made, 1);
        assert_eq!(status.meta.requests_left, 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_slots() {
        let (clock, backend) = backend();

        backend
            .get_and_increment("short", Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .get_and_increment("long", Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(backend.sweep(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(backend.sweep(), 1);
        assert_eq!(backend.len(), 1);

        backend.clear();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    backend
                        .get_and_increment("shared", Duration::from_secs(60))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let last = backend
            .get_and_increment("shared", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(last, 1601);
    }

    #[tokio::test]
    async fn test_sweeper_task_evicts_in_background() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));

        backend
            .get_and_increment("k", Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));

        let handle = backend.clone().spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(backend.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_backend_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let handle = backend.clone().spawn_sweeper(Duration::from_millis(10));
        assert_eq!(Arc::strong_count(&backend), 1);

        drop(backend);
        let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(finished.is_ok(), "sweeper kept running after the backend was dropped");
    }
}
