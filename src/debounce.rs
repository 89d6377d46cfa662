//! Cancellable scheduled tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A single pending deadline that each [`Debouncer::schedule`] call replaces.
///
/// The action runs while the slot lock is held and only if its generation is
/// still current, so once `cancel` or a newer `schedule` returns, the older
/// action can no longer fire.
#[derive(Clone, Default)]
pub struct Debouncer {
    slot: Arc<Mutex<Slot>>,
}

impl Debouncer {
    /// Creates an idle debouncer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `action` after `delay`, superseding any pending action.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        let generation = slot.generation;
        let shared = self.slot.clone();
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut slot = shared.lock();
            if slot.generation != generation {
                return;
            }
            slot.handle = None;
            action();
        }));
    }

    /// Cancels the pending action, if any. Idempotent.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    /// Whether an action is waiting for its deadline.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().handle.is_some()
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let make = move || {
            let c = count_clone.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let debouncer = Debouncer::new();
        let (count, make) = counter();

        debouncer.schedule(Duration::from_millis(100), make());
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes() {
        let debouncer = Debouncer::new();
        let (count, make) = counter();

        debouncer.schedule(Duration::from_millis(100), make());
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.schedule(Duration::from_millis(100), make());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let debouncer = Debouncer::new();
        let (count, make) = counter();

        debouncer.schedule(Duration::from_millis(10), make());
        debouncer.cancel();
        debouncer.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!debouncer.is_pending());
    }
}
