//! Pooled, cancellable one-shot timers.
//!
//! Every outstanding request schedules a bounded wait here. The central
//! race (a response arriving while the timer fires) is resolved by an
//! atomic state machine per timer: whoever wins the compare-exchange out
//! of `ARMED` owns the slot. The callback never runs after a successful
//! cancel, and cancel never reports success once the callback has started.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Timer states. ARMED is the only state cancel can win from.
const ARMED: u8 = 0;
const FIRING: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerSlot {
    state: AtomicU8,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to one scheduled timer.
///
/// The handle pins its own slot, so a handle kept past the pool's reuse
/// of the numeric id can never disarm someone else's timer.
pub struct TimerHandle {
    id: u64,
    slot: Arc<TimerSlot>,
}

impl TimerHandle {
    /// The pool-assigned slot id (diagnostics only).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("state", &self.slot.state.load(Ordering::SeqCst))
            .finish()
    }
}

/// Registry of live timers with slot-id pooling.
///
/// A slot id returns to the free pool after a successful cancel or after
/// the callback has fully run, never both.
pub struct TimerPool {
    slots: DashMap<u64, Arc<TimerSlot>>,
    free: Mutex<Vec<u64>>,
    next_id: AtomicU64,
}

impl TimerPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn acquire_id(&self) -> u64 {
        if let Some(id) = self.free.lock().pop() {
            return id;
        }
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn release(&self, id: u64) {
        self.slots.remove(&id);
        self.free.lock().push(id);
    }

    /// Schedule `callback` to run once after `duration`.
    ///
    /// The callback runs on a timer task unless the handle is cancelled
    /// first.
    pub fn schedule(
        self: &Arc<Self>,
        duration: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let id = self.acquire_id();
        let slot = Arc::new(TimerSlot {
            state: AtomicU8::new(ARMED),
            task: Mutex::new(None),
        });
        self.slots.insert(id, slot.clone());

        let pool = Arc::clone(self);
        let task_slot = slot.clone();
        let callback: TimerCallback = Box::new(callback);
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Win or lose the race against cancel().
            if task_slot
                .state
                .compare_exchange(ARMED, FIRING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            trace!(timer_id = id, "Timer fired");
            callback();
            task_slot.state.store(FIRED, Ordering::SeqCst);
            pool.release(id);
        });
        *slot.task.lock() = Some(task);

        TimerHandle { id, slot }
    }

    /// Disarm a timer.
    ///
    /// Returns true iff this call is the one that disarmed it: false when
    /// the callback has already started (or finished), or when the handle
    /// was cancelled before.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let won = handle
            .slot
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            if let Some(task) = handle.slot.task.lock().take() {
                task.abort();
            }
            self.release(handle.id);
            trace!(timer_id = handle.id, "Timer cancelled");
        }
        won
    }

    /// Number of timers currently armed or firing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_timer_fires() {
        let pool = Arc::new(TimerPool::new());
        let (tx, rx) = oneshot::channel();
        let _handle = pool.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timer should fire within a second")
            .unwrap();
        // Slot returns to the pool once the callback has run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_prevents_callback() {
        let pool = Arc::new(TimerPool::new());
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let handle = pool.schedule(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.cancel(&handle));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_second_cancel_returns_false() {
        let pool = Arc::new(TimerPool::new());
        let handle = pool.schedule(Duration::from_secs(60), || {});
        assert!(pool.cancel(&handle));
        assert!(!pool.cancel(&handle));
    }

    #[tokio::test]
    async fn test_cancel_after_fire_returns_false() {
        let pool = Arc::new(TimerPool::new());
        let (tx, rx) = oneshot::channel();
        let handle = pool.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pool.cancel(&handle));
    }

    #[tokio::test]
    async fn test_slot_ids_recycled() {
        let pool = Arc::new(TimerPool::new());
        let h1 = pool.schedule(Duration::from_secs(60), || {});
        let first_id = h1.id();
        assert!(pool.cancel(&h1));

        let h2 = pool.schedule(Duration::from_secs(60), || {});
        assert_eq!(h2.id(), first_id);

        // The stale handle cannot disarm the reused slot.
        assert!(!pool.cancel(&h1));
        assert!(pool.cancel(&h2));
    }

    #[tokio::test]
    async fn test_exactly_one_path_wins_race() {
        // Schedule timers with zero duration and immediately cancel;
        // whichever path wins, the callback count must equal the number
        // of failed cancels.
        let pool = Arc::new(TimerPool::new());
        let fired = Arc::new(AtomicU32::new(0));
        let mut cancelled = 0u32;
        for _ in 0..100 {
            let fired_clone = fired.clone();
            let handle = pool.schedule(Duration::from_millis(0), move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
            tokio::task::yield_now().await;
            if pool.cancel(&handle) {
                cancelled += 1;
            }
        }
        // Give losing fire tasks time to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst) + cancelled, 100);
    }
}
