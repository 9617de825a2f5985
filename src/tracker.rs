//! Completion tracking for batch runs.
//!
//! Workers report each finished text here; the tracker keeps an atomic
//! count and forwards the completed fraction to the user's callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Progress callback signature: receives a fraction in `[0, 1]`.
///
/// Invocations may race when several workers finish at once; making the
/// callback safe to call concurrently is the caller's responsibility.
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Counts completed texts and emits progress for one run.
pub struct ProgressTracker {
    done: AtomicUsize,
    total: usize,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// Create a tracker for `total` texts.
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total,
            callback,
        }
    }

    /// Record one completed text and report the new fraction.
    ///
    /// Called exactly once per successful completion, outside all locks.
    pub fn complete_one(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(callback) = &self.callback {
            callback(done as f32 / self.total as f32);
        }
    }

    /// Number of texts completed so far.
    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("done", &self.done())
            .field("total", &self.total)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_counts_and_fractions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = ProgressTracker::new(4, Some(Arc::new(move |f| sink.lock().push(f))));

        tracker.complete_one();
        tracker.complete_one();

        assert_eq!(tracker.done(), 2);
        assert_eq!(*seen.lock(), vec![0.25, 0.5]);
    }

    #[test]
    fn test_no_callback_is_fine() {
        let tracker = ProgressTracker::new(2, None);
        tracker.complete_one();
        assert_eq!(tracker.done(), 1);
    }
}
