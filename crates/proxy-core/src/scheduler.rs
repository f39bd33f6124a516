//! Tag-keyed delayed callbacks on the tokio runtime.
//!
//! Scheduling under a non-empty tag cancels any earlier task with the
//! same tag; an empty tag is fire-and-forget. Callback panics are caught
//! and logged so a misbehaving script cannot take the loop down.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Default)]
pub struct Scheduler {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` after `delay`. A non-empty `tag` replaces and
    /// cancels any pending task under the same tag.
    pub fn schedule(&mut self, tag: &str, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        self.tasks.retain(|_, handle| !handle.is_finished());

        let task_tag = tag.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!("scheduler.callback_panicked tag={task_tag}");
            }
        });

        if tag.is_empty() {
            return;
        }
        if let Some(previous) = self.tasks.insert(tag.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancels the pending task under `tag`, if any.
    pub fn cancel(&mut self, tag: &str) {
        if let Some(handle) = self.tasks.remove(tag) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn rescheduling_a_tag_replaces_the_first_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();

        let first = fired.clone();
        scheduler.schedule("x", Duration::from_millis(100), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        scheduler.schedule("x", Duration::from_millis(50), move || {
            second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_by_tag_aborts_the_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();

        let hit = fired.clone();
        scheduler.schedule("gone", Duration::from_millis(50), move || {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel("gone");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_drains_every_tag() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        for tag in ["a", "b", "c"] {
            let hit = fired.clone();
            scheduler.schedule(tag, Duration::from_millis(50), move || {
                hit.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.pending(), 3);
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_tag_is_untracked() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let first = fired.clone();
        scheduler.schedule("", Duration::from_millis(20), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        scheduler.schedule("", Duration::from_millis(20), move || {
            second.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_is_swallowed() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule("boom", Duration::from_millis(10), || panic!("bad script"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        // Reaching this point without the test runtime unwinding is the
        // assertion.
    }
}
