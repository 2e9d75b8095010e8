//! Sliding-window throughput measurement

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Records frame timestamps and reports the rate over a trailing time horizon.
///
/// The window is defined in time, not in sample count, so bursty arrivals
/// followed by gaps still produce a rate that reflects only the last
/// `window` worth of traffic. Timestamps are monotonic offsets with
/// nanosecond resolution.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    /// Oldest first, non-decreasing.
    timestamps: VecDeque<Duration>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(PipelineError::InvalidConfiguration(
                "rate window must be positive".into(),
            ));
        }

        Ok(Self {
            window,
            timestamps: VecDeque::new(),
        })
    }

    /// Build a window from a size in milliseconds, rejecting non-positive
    /// and non-finite sizes.
    pub fn from_millis(window_ms: f64) -> Result<Self> {
        if !window_ms.is_finite() || window_ms <= 0.0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "rate window must be positive, got {window_ms}ms"
            )));
        }

        let window = Duration::try_from_secs_f64(window_ms / 1_000.0).map_err(|_| {
            PipelineError::InvalidConfiguration(format!(
                "rate window of {window_ms}ms is out of range"
            ))
        })?;
        Self::new(window)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a timestamp and drop everything older than the window.
    ///
    /// A timestamp older than the newest one already recorded is still
    /// accepted; it is slotted into order and pruning keeps using the newest
    /// value as the reference point.
    pub fn record(&mut self, timestamp: Duration) {
        let at = self.timestamps.partition_point(|t| *t <= timestamp);
        self.timestamps.insert(at, timestamp);

        let Some(&newest) = self.timestamps.back() else {
            return;
        };
        while let Some(&oldest) = self.timestamps.front() {
            if newest - oldest > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Intervals per second across the retained timestamps.
    pub fn rate(&self) -> f64 {
        match self.span() {
            Some(span) if !span.is_zero() => {
                (self.timestamps.len() - 1) as f64 / span.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    /// Mean gap between consecutive retained timestamps.
    pub fn mean_interval(&self) -> Option<Duration> {
        let span = self.span().filter(|s| !s.is_zero())?;
        let intervals = u32::try_from(self.timestamps.len() - 1).ok()?;
        Some(span / intervals)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn reset(&mut self) {
        self.timestamps.clear();
    }

    /// Distance between oldest and newest, if at least two are retained.
    fn span(&self) -> Option<Duration> {
        if self.timestamps.len() < 2 {
            return None;
        }
        let oldest = *self.timestamps.front()?;
        let newest = *self.timestamps.back()?;
        Some(newest.saturating_sub(oldest))
    }
}

/// A [`RateWindow`] shared between the thread that records and the threads
/// that poll. Each record (append + prune) happens under one lock, so a
/// reader never sees a half-pruned window.
#[derive(Debug)]
pub struct SharedRateWindow {
    inner: Mutex<RateWindow>,
}

impl SharedRateWindow {
    pub fn new(window: RateWindow) -> Self {
        Self {
            inner: Mutex::new(window),
        }
    }

    pub fn record(&self, timestamp: Duration) {
        self.lock().record(timestamp);
    }

    pub fn rate(&self) -> f64 {
        self.lock().rate()
    }

    pub fn mean_interval(&self) -> Option<Duration> {
        self.lock().mean_interval()
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
