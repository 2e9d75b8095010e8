//! Frame pipeline: bounded intake, ordered parallel processing, latest-result
//! cache and windowed rate measurement wired together.

pub mod buffer;
pub mod cache;
pub mod processor;
pub mod rate;
pub(crate) mod reorder;
pub mod transform;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::Receiver;
use tracing::{debug, error, info, warn};

pub use buffer::{BackpressurePolicy, BoundedFrameBuffer, BufferStats, Enqueued};
pub use cache::{CacheStats, LatestResultCache};
pub use processor::{Outcome, ParallelOrderedProcessor, Processed, ProcessorOptions, ShutdownReport};
pub use rate::{RateWindow, SharedRateWindow};
pub use transform::{FrameSummary, SimulatedTransform, Transform};

use crate::capture::Frame;
use crate::error::Result;
use crate::PipelineConfig;

/// A result that made it through the transform, with the sequence number of
/// the frame it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Completed<R> {
    pub sequence: u64,
    pub value: R,
}

/// Point-in-time view of pipeline health
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub input_fps: f64,
    pub output_fps: f64,
    /// Mean gap between accepted frames over the rate window
    pub input_interval: Option<Duration>,
    /// Mean gap between completed results over the rate window
    pub output_interval: Option<Duration>,
    pub submitted: u64,
    pub evicted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Highest sequence number delivered downstream, if any
    pub last_sequence: Option<u64>,
    pub cache: CacheStats,
    pub queued: usize,
    pub reorder_high_water: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
    /// `u64::MAX` until the first result lands.
    last_sequence: AtomicU64,
}

/// State shared between the pipeline handle and its collector thread
struct Shared<R> {
    epoch: Instant,
    cache: LatestResultCache<Completed<R>>,
    input_rate: SharedRateWindow,
    output_rate: SharedRateWindow,
    counters: CachePadded<Counters>,
}

impl<R> Shared<R> {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// One active frame stream.
///
/// ```text
/// submit ─▶ BoundedFrameBuffer ─▶ W workers ─▶ reorder ─▶ collector ─▶ LatestResultCache
///    │                                                        │
///    └─▶ input RateWindow                                     └─▶ output RateWindow
/// ```
pub struct FramePipeline<P, R> {
    processor: ParallelOrderedProcessor<P, R>,
    shared: Arc<Shared<R>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Option<Duration>,
}

impl<P, R> FramePipeline<P, R>
where
    P: Send + 'static,
    R: Send + Sync + 'static,
{
    pub fn new<T>(config: &PipelineConfig, transform: T) -> Result<Self>
    where
        T: Transform<P, R>,
    {
        config.validate()?;

        let input_rate = RateWindow::from_millis(config.rate_window_ms)?;
        let output_rate = input_rate.clone();
        let buffer = BoundedFrameBuffer::new(config.buffer_capacity, config.backpressure)?;
        let options = ProcessorOptions {
            workers: config.workers,
            pin_workers: config.pin_workers,
        };
        let (processor, results) = ParallelOrderedProcessor::spawn(buffer, options, transform)?;

        let shared = Arc::new(Shared {
            epoch: Instant::now(),
            cache: LatestResultCache::new(),
            input_rate: SharedRateWindow::new(input_rate),
            output_rate: SharedRateWindow::new(output_rate),
            counters: CachePadded::new(Counters {
                last_sequence: AtomicU64::new(u64::MAX),
                ..Counters::default()
            }),
        });

        let collector = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("framepipe-collector".into())
                .spawn(move || collect(&shared, &results))?
        };

        info!(
            capacity = config.buffer_capacity,
            workers = config.workers,
            policy = ?config.backpressure,
            window_ms = config.rate_window_ms,
            "Frame pipeline ready"
        );

        Ok(Self {
            processor,
            shared,
            collector: Mutex::new(Some(collector)),
            shutdown_timeout: config.shutdown_timeout_ms.map(Duration::from_millis),
        })
    }
}

impl<P, R> FramePipeline<P, R> {
    /// Monotonic time since the pipeline was created.
    pub fn now(&self) -> Duration {
        self.shared.now()
    }

    /// Accept one captured frame.
    ///
    /// Under `BlockProducer` this waits for room in the buffer. The input
    /// rate is recorded from `timestamp` once the frame is accepted.
    pub fn submit(&self, payload: P, timestamp: Duration) -> Result<Enqueued> {
        self.submit_frame(Frame::new(payload, timestamp))
    }

    /// Accept a frame built by the capture side. Its sequence number is
    /// reassigned by the buffer.
    pub fn submit_frame(&self, frame: Frame<P>) -> Result<Enqueued> {
        let timestamp = frame.timestamp();
        let enqueued = self.processor.enqueue(frame)?;
        self.shared.input_rate.record(timestamp);
        Ok(enqueued)
    }

    /// [`submit`](Self::submit) stamped with the pipeline clock.
    pub fn submit_now(&self, payload: P) -> Result<Enqueued> {
        self.submit(payload, self.now())
    }

    /// Most recent completed result, if any.
    pub fn latest(&self) -> Option<Arc<Completed<R>>> {
        self.shared.cache.latest()
    }

    pub fn cache(&self) -> &LatestResultCache<Completed<R>> {
        &self.shared.cache
    }

    /// Frames per second accepted at intake over the rate window.
    pub fn input_rate(&self) -> f64 {
        self.shared.input_rate.rate()
    }

    /// Results per second completed over the rate window.
    pub fn output_rate(&self) -> f64 {
        self.shared.output_rate.rate()
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        let last_sequence = counters.last_sequence.load(Ordering::Acquire);
        let buffer = self.processor.buffer();
        let input_fps = self.input_rate();
        let output_fps = self.output_rate();
        metrics::gauge!("framepipe_input_fps").set(input_fps);
        metrics::gauge!("framepipe_output_fps").set(output_fps);

        PipelineStats {
            input_fps,
            output_fps,
            input_interval: self.shared.input_rate.mean_interval(),
            output_interval: self.shared.output_rate.mean_interval(),
            submitted: buffer.stats().enqueued,
            evicted: counters.evicted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            last_sequence: (last_sequence != u64::MAX).then_some(last_sequence),
            cache: self.shared.cache.stats(),
            queued: buffer.len(),
            reorder_high_water: self.processor.reorder_high_water(),
        }
    }

    /// Stop intake, drain in-flight frames, and wait for every result to
    /// reach the cache.
    ///
    /// Uses the configured shutdown deadline when there is one. Calling it
    /// again after a successful shutdown is a no-op.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        let report = match self.shutdown_timeout {
            Some(timeout) => self.processor.shutdown_timeout(timeout),
            None => Ok(self.processor.shutdown()),
        };

        // The processor has closed the result stream by now, even when it
        // abandoned workers, so the collector is about to run dry.
        let collector = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(collector) = collector {
            if collector.join().is_err() {
                error!("Collector thread panicked");
            }
        }

        if let Ok(report) = &report {
            info!(joined = report.joined, "Frame pipeline stopped");
        }
        report
    }
}

/// Moves ordered results into the cache and the output rate window.
fn collect<R>(shared: &Shared<R>, results: &Receiver<Processed<R>>) {
    for processed in results.iter() {
        let sequence = processed.sequence;
        match processed.outcome {
            Outcome::Completed(value) => {
                shared.cache.update(Completed { sequence, value });
                shared.output_rate.record(shared.now());
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed(e) => {
                warn!(sequence, "Frame failed: {}", e);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Evicted => {
                debug!(sequence, "Frame evicted before processing");
                shared.counters.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        shared
            .counters
            .last_sequence
            .store(sequence, Ordering::Release);
    }

    debug!("Result stream closed, collector exiting");
}
