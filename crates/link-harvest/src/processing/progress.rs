//! Progress tracking and emission throttling

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::job::percent;

/// When progress updates are pushed to subscribers
///
/// Snapshots queried by polling are always current; the policy only governs
/// push emission. The final update (completed == total) is always emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProgressPolicy {
    /// Emit at every chunk boundary
    #[default]
    EveryChunk,
    /// Emit once at least `items` more records have completed
    EveryItems { items: usize },
    /// Emit only when the batch is complete
    CompletionOnly,
}

/// Point-in-time progress reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}

/// Lock-free progress counter for a job, one attempt at a time
///
/// `update` is called at chunk boundaries and decides what is pushed;
/// `snapshot` is what gets committed for pollers. Completed counts never
/// decrease within an attempt and each value is emitted at most once.
#[derive(Debug)]
pub struct ProgressTracker {
    completed: AtomicUsize,
    total: AtomicUsize,
    last_emitted: AtomicUsize,
    policy: ProgressPolicy,
}

impl ProgressTracker {
    pub fn new(total: usize, policy: ProgressPolicy) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(total),
            last_emitted: AtomicUsize::new(0),
            policy,
        }
    }

    /// Record progress; returns `true` when the update should be emitted
    pub fn update(&self, completed: usize, total: usize) -> bool {
        self.total.store(total, Ordering::SeqCst);
        let completed = completed.min(total);
        let previous = self.completed.fetch_max(completed, Ordering::SeqCst);
        let current = previous.max(completed);

        let last = self.last_emitted.load(Ordering::SeqCst);
        if current <= last {
            return false;
        }

        let due = current == total
            || match self.policy {
                ProgressPolicy::EveryChunk => true,
                ProgressPolicy::EveryItems { items } => current - last >= items.max(1),
                ProgressPolicy::CompletionOnly => false,
            };

        // Only one caller wins the emission for a given value
        due && self
            .last_emitted
            .compare_exchange(last, current, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst).min(total);
        ProgressSnapshot {
            completed,
            total,
            percent: percent(completed, total),
        }
    }

    /// Start a fresh attempt at zero
    pub fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
        self.last_emitted.store(0, Ordering::SeqCst);
    }
}
