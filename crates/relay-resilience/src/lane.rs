//! Per-key admission control with FIFO waiting.
//!
//! Each key owns an occupancy counter and a bounded wait queue. A release
//! hands the slot straight to the oldest live waiter, so occupancy always
//! equals the number of real holders. Every handle is stamped with the
//! registry generation; bumping the generation with
//! [`LaneRegistry::reset_generation`] turns all outstanding handles into
//! no-ops at once.

use parking_lot::Mutex;
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lane limits shared by every key in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Concurrent holders allowed per key.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Callers allowed to wait per key before `QueueFull`.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Default wait before a queued caller fails with a timeout.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_queue() -> usize {
    64
}

fn default_wait_timeout_ms() -> u64 {
    120_000
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

type Grant = RelayResult<u64>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct LaneState {
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl LaneState {
    fn is_idle(&self) -> bool {
        self.active == 0 && self.waiters.is_empty()
    }

    /// Hands one slot to the oldest waiter still listening.
    fn hand_off(&mut self, generation: u64) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(Ok(generation)).is_ok() {
                return true;
            }
        }
        false
    }
}

#[derive(Default)]
struct Lanes {
    generation: u64,
    next_waiter: u64,
    by_key: HashMap<String, LaneState>,
}

struct LaneShared {
    config: LaneConfig,
    lanes: Mutex<Lanes>,
}

/// Registry of concurrency lanes, one per key, created lazily.
///
/// Clones share state; hand one registry to every runner that should share
/// admission limits.
#[derive(Clone)]
pub struct LaneRegistry {
    shared: Arc<LaneShared>,
}

impl Default for LaneRegistry {
    fn default() -> Self {
        Self::new(LaneConfig::default())
    }
}

impl LaneRegistry {
    /// Creates an empty registry.
    pub fn new(config: LaneConfig) -> Self {
        Self {
            shared: Arc::new(LaneShared {
                config,
                lanes: Mutex::new(Lanes::default()),
            }),
        }
    }

    /// The limits this registry enforces.
    pub fn config(&self) -> &LaneConfig {
        &self.shared.config
    }

    fn limit(&self) -> usize {
        self.shared.config.max_concurrent.max(1)
    }

    /// Acquires a slot on `key`, waiting up to the configured timeout.
    pub async fn acquire(&self, key: &str) -> RelayResult<LaneHandle> {
        let timeout = Duration::from_millis(self.shared.config.wait_timeout_ms);
        self.acquire_with_timeout(key, timeout).await
    }

    /// Acquires a slot on `key`, waiting up to `timeout` in the FIFO queue.
    ///
    /// Fails with [`RelayError::QueueFull`] when the queue is at capacity,
    /// [`RelayError::LaneTimeout`] when the wait expires and
    /// [`RelayError::LaneCleared`] when the queue is cleared. Dropping the
    /// returned future withdraws the caller from the queue.
    pub async fn acquire_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> RelayResult<LaneHandle> {
        let (id, rx) = {
            let mut guard = self.shared.lanes.lock();
            let lanes = &mut *guard;
            let generation = lanes.generation;
            let limit = self.limit();
            let lane = lanes.by_key.entry(key.to_string()).or_default();

            if lane.active < limit && lane.waiters.is_empty() {
                lane.active += 1;
                debug!(key, active = lane.active, limit, "Lane slot granted");
                return Ok(LaneHandle::new(self.clone(), key, generation));
            }

            let capacity = self.shared.config.max_queue;
            if lane.waiters.len() >= capacity {
                warn!(key, capacity, "Lane queue full");
                return Err(RelayError::QueueFull {
                    key: key.to_string(),
                    capacity,
                });
            }

            let id = lanes.next_waiter;
            lanes.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            lane.waiters.push_back(Waiter { id, tx });
            debug!(key, queued = lane.waiters.len(), "Lane busy, waiting");
            (id, rx)
        };

        let started = Instant::now();
        let mut waiter = QueuedWaiter {
            registry: self.clone(),
            key: key.to_string(),
            id,
            rx,
            settled: false,
        };

        let outcome = tokio::time::timeout(timeout, &mut waiter.rx).await;
        waiter.settled = true;
        match outcome {
            Ok(Ok(Ok(generation))) => {
                debug!(key, waited_ms = started.elapsed().as_millis() as u64, "Lane slot handed off");
                Ok(LaneHandle::new(self.clone(), key, generation))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RelayError::LaneCleared {
                key: key.to_string(),
            }),
            Err(_) => {
                if waiter.withdraw() {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(key, waited_ms, "Lane wait timed out");
                    return Err(RelayError::LaneTimeout {
                        key: key.to_string(),
                        waited_ms,
                    });
                }
                // The slot arrived while the timer fired.
                match waiter.rx.try_recv() {
                    Ok(Ok(generation)) => Ok(LaneHandle::new(self.clone(), key, generation)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(RelayError::LaneTimeout {
                        key: key.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            }
        }
    }

    fn release_slot(&self, key: &str, generation: u64) {
        let mut guard = self.shared.lanes.lock();
        let lanes = &mut *guard;
        if generation != lanes.generation {
            debug!(key, generation, current = lanes.generation, "Stale lane release ignored");
            return;
        }
        let Some(lane) = lanes.by_key.get_mut(key) else {
            return;
        };
        if lane.hand_off(generation) {
            return;
        }
        lane.active = lane.active.saturating_sub(1);
        if lane.is_idle() {
            lanes.by_key.remove(key);
        }
    }

    /// Current holders on `key`.
    pub fn occupancy(&self, key: &str) -> usize {
        self.shared
            .lanes
            .lock()
            .by_key
            .get(key)
            .map_or(0, |l| l.active)
    }

    /// Callers currently waiting on `key`.
    pub fn queued(&self, key: &str) -> usize {
        self.shared
            .lanes
            .lock()
            .by_key
            .get(key)
            .map_or(0, |l| l.waiters.len())
    }

    /// The generation new handles are stamped with.
    pub fn generation(&self) -> u64 {
        self.shared.lanes.lock().generation
    }

    /// Invalidates every outstanding handle and re-admits queued waiters.
    ///
    /// Occupancy restarts at zero; waiters are granted slots under the new
    /// generation in FIFO order up to the limit.
    pub fn reset_generation(&self) -> u64 {
        let limit = self.limit();
        let mut guard = self.shared.lanes.lock();
        let lanes = &mut *guard;
        lanes.generation += 1;
        let generation = lanes.generation;
        for lane in lanes.by_key.values_mut() {
            lane.active = 0;
            while lane.active < limit && lane.hand_off(generation) {
                lane.active += 1;
            }
        }
        lanes.by_key.retain(|_, lane| !lane.is_idle());
        info!(generation, "Lane generation reset");
        generation
    }

    /// Rejects every caller waiting on `key` with [`RelayError::LaneCleared`].
    pub fn clear_waiters(&self, key: &str) -> usize {
        let mut guard = self.shared.lanes.lock();
        let Some(lane) = guard.by_key.get_mut(key) else {
            return 0;
        };
        let cleared = reject_all(key, lane);
        if lane.is_idle() {
            guard.by_key.remove(key);
        }
        if cleared > 0 {
            info!(key, cleared, "Lane waiters cleared");
        }
        cleared
    }

    /// Rejects all waiters on every key and invalidates outstanding handles.
    pub fn dispose(&self) {
        let mut guard = self.shared.lanes.lock();
        let lanes = &mut *guard;
        for (key, lane) in lanes.by_key.iter_mut() {
            reject_all(key, lane);
        }
        lanes.by_key.clear();
        lanes.generation += 1;
        info!(generation = lanes.generation, "Lane registry disposed");
    }
}

fn reject_all(key: &str, lane: &mut LaneState) -> usize {
    let mut cleared = 0;
    for waiter in lane.waiters.drain(..) {
        let _ = waiter.tx.send(Err(RelayError::LaneCleared {
            key: key.to_string(),
        }));
        cleared += 1;
    }
    cleared
}

/// A caller parked in a lane queue.
///
/// Dropping it before the grant is consumed withdraws it from the queue, or
/// gives back a slot that was already handed to it.
struct QueuedWaiter {
    registry: LaneRegistry,
    key: String,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl QueuedWaiter {
    /// Removes this waiter from its queue; `false` if a grant was already sent.
    fn withdraw(&self) -> bool {
        let mut guard = self.registry.shared.lanes.lock();
        let Some(lane) = guard.by_key.get_mut(&self.key) else {
            return false;
        };
        let Some(pos) = lane.waiters.iter().position(|w| w.id == self.id) else {
            return false;
        };
        lane.waiters.remove(pos);
        if lane.is_idle() {
            guard.by_key.remove(&self.key);
        }
        true
    }
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        if self.settled || self.withdraw() {
            return;
        }
        if let Ok(Ok(generation)) = self.rx.try_recv() {
            debug!(key = %self.key, "Returning slot handed to an abandoned waiter");
            self.registry.release_slot(&self.key, generation);
        }
    }
}

/// Proof of admission to a lane.
///
/// Released exactly once, either by [`LaneHandle::release`] or on drop. A
/// handle from before a generation reset releases nothing.
pub struct LaneHandle {
    registry: LaneRegistry,
    key: String,
    generation: u64,
    released: bool,
}

impl std::fmt::Debug for LaneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}

impl LaneHandle {
    fn new(registry: LaneRegistry, key: &str, generation: u64) -> Self {
        Self {
            registry,
            key: key.to_string(),
            generation,
            released: false,
        }
    }

    /// Lane key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Generation the handle was issued under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the slot has been given back.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Gives the slot back. Further calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.release_slot(&self.key, self.generation);
    }
}

impl Drop for LaneHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry(max_concurrent: usize, max_queue: usize) -> LaneRegistry {
        LaneRegistry::new(LaneConfig {
            max_concurrent,
            max_queue,
            wait_timeout_ms: 60_000,
        })
    }

    async fn wait_until_queued(lanes: &LaneRegistry, key: &str, n: usize) {
        while lanes.queued(key) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn grants_immediately_under_limit() {
        let lanes = registry(2, 4);
        let a = lanes.acquire("s1").await.unwrap();
        let b = lanes.acquire("s1").await.unwrap();
        assert_eq!(lanes.occupancy("s1"), 2);
        assert_eq!(lanes.occupancy("s2"), 0);
        drop(a);
        drop(b);
        assert_eq!(lanes.occupancy("s1"), 0);
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let lanes = registry(1, 1);
        let _held = lanes.acquire("s").await.unwrap();
        let waiting = {
            let lanes = lanes.clone();
            tokio::spawn(async move { lanes.acquire("s").await.map(|_| ()) })
        };
        wait_until_queued(&lanes, "s", 1).await;
        let err = lanes.acquire("s").await.unwrap_err();
        assert!(matches!(err, RelayError::QueueFull { capacity: 1, .. }));
        waiting.abort();
    }

    #[tokio::test]
    async fn release_hands_off_in_fifo_order() {
        let lanes = registry(1, 8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut first = lanes.acquire("s").await.unwrap();

        let mut tasks = Vec::new();
        for name in ["a", "b", "c"] {
            let lanes_c = lanes.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let mut h = lanes_c.acquire("s").await.unwrap();
                assert_eq!(lanes_c.occupancy("s"), 1);
                order.lock().push(name);
                h.release();
            }));
            wait_until_queued(&lanes, "s", tasks.len()).await;
        }

        first.release();
        assert_eq!(lanes.occupancy("s"), 1);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(lanes.occupancy("s"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_times_out() {
        let lanes = registry(1, 4);
        let _held = lanes.acquire("s").await.unwrap();
        let err = lanes
            .acquire_with_timeout("s", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::LaneTimeout { .. }));
        assert_eq!(lanes.queued("s"), 0);
        assert_eq!(lanes.occupancy("s"), 1);
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let lanes = registry(2, 4);
        let mut a = lanes.acquire("s").await.unwrap();
        let _b = lanes.acquire("s").await.unwrap();
        a.release();
        a.release();
        assert!(a.is_released());
        assert_eq!(lanes.occupancy("s"), 1);
    }

    #[tokio::test]
    async fn stale_generation_release_is_ignored() {
        let lanes = registry(1, 4);
        let mut old = lanes.acquire("s").await.unwrap();
        lanes.reset_generation();
        assert_eq!(lanes.occupancy("s"), 0);

        let fresh = lanes.acquire("s").await.unwrap();
        assert_eq!(fresh.generation(), old.generation() + 1);
        old.release();
        assert_eq!(lanes.occupancy("s"), 1);
        drop(fresh);
        assert_eq!(lanes.occupancy("s"), 0);
    }

    #[tokio::test]
    async fn reset_generation_readmits_waiters() {
        let lanes = registry(1, 4);
        let _old = lanes.acquire("s").await.unwrap();
        let waiter = {
            let lanes = lanes.clone();
            tokio::spawn(async move { lanes.acquire("s").await })
        };
        wait_until_queued(&lanes, "s", 1).await;
        let generation = lanes.reset_generation();
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.generation(), generation);
        assert_eq!(lanes.occupancy("s"), 1);
    }

    #[tokio::test]
    async fn clear_waiters_rejects_queued_callers() {
        let lanes = registry(1, 4);
        let _held = lanes.acquire("s").await.unwrap();
        let waiter = {
            let lanes = lanes.clone();
            tokio::spawn(async move { lanes.acquire("s").await.map(|_| ()) })
        };
        wait_until_queued(&lanes, "s", 1).await;
        assert_eq!(lanes.clear_waiters("s"), 1);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::LaneCleared { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_leaves_the_queue() {
        let lanes = registry(1, 4);
        let mut held = lanes.acquire("s").await.unwrap();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), lanes.acquire("s")).await;
        assert!(abandoned.is_err());
        assert_eq!(lanes.queued("s"), 0);
        held.release();
        assert_eq!(lanes.occupancy("s"), 0);
    }

    #[tokio::test]
    async fn dispose_rejects_and_invalidates() {
        let lanes = registry(1, 4);
        let mut held = lanes.acquire("s").await.unwrap();
        let waiter = {
            let lanes = lanes.clone();
            tokio::spawn(async move { lanes.acquire("s").await.map(|_| ()) })
        };
        wait_until_queued(&lanes, "s", 1).await;
        lanes.dispose();
        assert!(matches!(
            waiter.await.unwrap().unwrap_err(),
            RelayError::LaneCleared { .. }
        ));
        held.release();
        assert_eq!(lanes.occupancy("s"), 0);
        let _again = lanes.acquire("s").await.unwrap();
        assert_eq!(lanes.occupancy("s"), 1);
    }
}
