//! Single-slot holder for the most recent completed result

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};
use crossbeam::utils::CachePadded;

/// Holds the latest result and releases the one it replaces.
///
/// The swap is a single atomic pointer exchange, so a reader sees either
/// the old or the new value, never a mix. The cache drops its reference to
/// the superseded result inside `update`, before returning. A reader still
/// holding a [`peek`](Self::peek) guard or a [`latest`](Self::latest) handle
/// keeps that result alive until it lets go; the payload is freed by
/// whichever side drops last.
pub struct LatestResultCache<T> {
    slot: ArcSwapOption<T>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    updates: AtomicU64,
    releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub updates: u64,
    /// Results the cache let go of, by replacement or `clear`
    pub releases: u64,
}

impl<T> LatestResultCache<T> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Publish `result`, releasing whatever it supersedes.
    pub fn update(&self, result: T) {
        let previous = self.slot.swap(Some(Arc::new(result)));
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = previous {
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
            drop(previous);
        }
    }

    /// Borrow the current result without taking a handle to it.
    ///
    /// Keep the guard short-lived: it pins the result it points at.
    pub fn peek(&self) -> Guard<Option<Arc<T>>> {
        self.slot.load()
    }

    /// Run `f` against the current result.
    pub fn peek_with<U>(&self, f: impl FnOnce(Option<&T>) -> U) -> U {
        let guard = self.slot.load();
        f(guard.as_deref())
    }

    /// Shared handle to the current result, for callers that need to keep it.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }

    /// Release the held result, leaving the cache empty.
    pub fn clear(&self) {
        if let Some(previous) = self.slot.swap(None) {
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
            drop(previous);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            updates: self.stats.updates.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for LatestResultCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
