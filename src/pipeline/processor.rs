//! Parallel worker pool with ordered output

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self as cb, RecvTimeoutError};
use flume::Receiver;
use tracing::{debug, error, info, instrument, warn};

use super::buffer::{BoundedFrameBuffer, Enqueued};
use super::reorder::Reorderer;
use super::transform::Transform;
use crate::capture::Frame;
use crate::error::{PipelineError, Result, TransformError};

/// What happened to one frame
#[derive(Debug)]
pub enum Outcome<R> {
    Completed(R),
    Failed(TransformError),
    /// Displaced from the buffer under `DropOldest` before any worker saw it
    Evicted,
}

/// A result released by the processor, in sequence order
#[derive(Debug)]
pub struct Processed<R> {
    pub sequence: u64,
    pub outcome: Outcome<R>,
}

impl<R> Processed<R> {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }

    /// Tag failures and evictions with their sequence number.
    pub fn into_result(self) -> Result<R> {
        match self.outcome {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(source) => Err(PipelineError::TransformFailure {
                sequence: self.sequence,
                source,
            }),
            Outcome::Evicted => Err(PipelineError::Evicted {
                sequence: self.sequence,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorOptions {
    pub workers: usize,
    /// Pin each worker to its own core when the platform allows it
    pub pin_workers: bool,
}

impl ProcessorOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            pin_workers: false,
        }
    }
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

/// Runs a transform over buffered frames on `W` threads and re-emits the
/// results in the order the frames were enqueued.
pub struct ParallelOrderedProcessor<P, R> {
    buffer: Arc<BoundedFrameBuffer<P>>,
    reorder: Arc<Reorderer<R>>,
    workers: Mutex<Vec<Worker>>,
    exits: cb::Receiver<usize>,
}

impl<P, R> ParallelOrderedProcessor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Start the worker pool over `buffer`.
    ///
    /// Returns the processor and the receiving end of the ordered results.
    /// The receiver must be drained (or dropped) by the caller, and
    /// disconnects once the processor has shut down.
    #[instrument(skip(buffer, transform))]
    pub fn spawn<T>(
        buffer: BoundedFrameBuffer<P>,
        options: ProcessorOptions,
        transform: T,
    ) -> Result<(Self, Receiver<Processed<R>>)>
    where
        T: Transform<P, R>,
    {
        if options.workers == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "worker count must be at least 1".into(),
            ));
        }

        // Unbounded so a send under the reorder lock can never park a worker
        // or the producer; the frame buffer is where the backlog is bounded.
        let (tx, rx) = flume::unbounded();
        let buffer = Arc::new(buffer);
        let reorder = Arc::new(Reorderer::new(tx, options.workers));
        let transform = Arc::new(transform);
        let (exit_tx, exits) = cb::unbounded();

        let cores = if options.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(options.workers);
        for id in 0..options.workers {
            let core = (!cores.is_empty()).then(|| cores[id % cores.len()]);
            let worker_buffer = buffer.clone();
            let reorder = reorder.clone();
            let transform = transform.clone();
            let notice = ExitNotice {
                id,
                tx: exit_tx.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("framepipe-worker-{id}"))
                .spawn(move || {
                    let _notice = notice;
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!(worker = id, "Failed to pin worker to core {:?}", core);
                        }
                    }
                    run_worker(id, &worker_buffer, &reorder, &*transform);
                });

            match spawned {
                Ok(handle) => workers.push(Worker { id, handle }),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", id, e);
                    buffer.close();
                    for worker in workers {
                        let _ = worker.handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            "Processor started with {} workers over a {:?} buffer of {}",
            options.workers,
            buffer.policy(),
            buffer.capacity()
        );

        Ok((
            Self {
                buffer,
                reorder,
                workers: Mutex::new(workers),
                exits,
            },
            rx,
        ))
    }
}

impl<P, R> ParallelOrderedProcessor<P, R> {
    /// Hand a frame to the buffer.
    ///
    /// A frame evicted to make room is reported downstream as
    /// [`Outcome::Evicted`] so the ordered output has no silent gaps.
    pub fn enqueue(&self, frame: Frame<P>) -> Result<Enqueued> {
        let enqueued = self.buffer.enqueue(frame)?;
        if let Some(evicted) = enqueued.evicted {
            self.reorder.skip(evicted);
        }
        Ok(enqueued)
    }

    /// The intake buffer, for inspection. Frames must go through
    /// [`enqueue`](Self::enqueue) so evictions reach the ordered output.
    pub fn buffer(&self) -> &BoundedFrameBuffer<P> {
        &self.buffer
    }

    /// Results completed early and parked waiting for a lower sequence.
    pub fn pending_results(&self) -> usize {
        self.reorder.pending()
    }

    /// Most results ever parked at once.
    pub fn reorder_high_water(&self) -> usize {
        self.reorder.high_water()
    }

    /// Close the buffer, let the workers drain it, and wait for all of them.
    pub fn shutdown(&self) -> ShutdownReport {
        self.buffer.close();
        let workers = std::mem::take(&mut *self.lock_workers());
        let joined = workers.len();
        for worker in workers {
            if worker.handle.join().is_err() {
                error!(worker = worker.id, "Worker thread panicked");
            }
        }
        self.reorder.finish();
        debug!(joined, "Processor shut down");
        ShutdownReport {
            joined,
            abandoned: 0,
        }
    }

    /// Like [`shutdown`](Self::shutdown), but gives up on workers still
    /// running when `timeout` elapses. Abandoned workers are detached and
    /// reported through [`PipelineError::ShutdownTimedOut`].
    pub fn shutdown_timeout(&self, timeout: Duration) -> Result<ShutdownReport> {
        self.buffer.close();
        let deadline = Instant::now() + timeout;
        let mut workers = std::mem::take(&mut *self.lock_workers());

        let mut joined = 0;
        while !workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exits.recv_timeout(remaining) {
                Ok(id) => {
                    if let Some(pos) = workers.iter().position(|w| w.id == id) {
                        let worker = workers.swap_remove(pos);
                        if worker.handle.join().is_err() {
                            error!(worker = id, "Worker thread panicked");
                        }
                        joined += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.reorder.finish();

        let abandoned = workers.len();
        if abandoned > 0 {
            let ids: Vec<usize> = workers.iter().map(|w| w.id).collect();
            warn!(?ids, "Shutdown deadline of {:?} elapsed, abandoning workers", timeout);
            return Err(PipelineError::ShutdownTimedOut { joined, abandoned });
        }

        debug!(joined, "Processor shut down");
        Ok(ShutdownReport { joined, abandoned })
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, R> Drop for ParallelOrderedProcessor<P, R> {
    fn drop(&mut self) {
        // Workers block on the buffer; closing it lets them exit on their own.
        self.buffer.close();
    }
}

/// Tells the shutdown path a worker has exited, including by panic.
struct ExitNotice {
    id: usize,
    tx: cb::Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

fn run_worker<P, R, T>(
    id: usize,
    buffer: &BoundedFrameBuffer<P>,
    reorder: &Reorderer<R>,
    transform: &T,
) where
    T: Transform<P, R>,
{
    debug!(worker = id, "Worker started");
    let mut processed = 0u64;

    while let Some(frame) = buffer.dequeue() {
        let sequence = frame.sequence();
        reorder.admit(sequence);
        let started = Instant::now();

        // The frame moves into the transform; whatever it does not forward
        // is released there, even if it unwinds.
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| transform.apply(frame))) {
            Ok(Ok(result)) => {
                metrics::counter!("framepipe_results_completed_total").increment(1);
                Outcome::Completed(result)
            }
            Ok(Err(e)) => {
                warn!(worker = id, sequence, "Transform failed: {}", e);
                metrics::counter!("framepipe_results_failed_total").increment(1);
                Outcome::Failed(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = id, sequence, "Transform panicked: {}", message);
                metrics::counter!("framepipe_results_failed_total").increment(1);
                Outcome::Failed(TransformError::Panicked(message))
            }
        };

        debug!(
            worker = id,
            sequence,
            "Transform took {} us",
            started.elapsed().as_micros()
        );
        reorder.complete(sequence, outcome);
        processed += 1;
    }

    debug!(worker = id, processed, "Worker exiting, buffer drained");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::buffer::BackpressurePolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(i: u64) -> Frame<u64> {
        Frame::new(i, Duration::from_millis(i))
    }

    fn identity(frame: Frame<u64>) -> std::result::Result<u64, TransformError> {
        Ok(frame.into_payload())
    }

    #[test]
    fn zero_workers_is_invalid() {
        let buffer = BoundedFrameBuffer::new(4, BackpressurePolicy::BlockProducer).unwrap();
        let result = ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(0), identity);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn slow_early_frames_do_not_reorder_output() {
        let buffer = BoundedFrameBuffer::new(8, BackpressurePolicy::BlockProducer).unwrap();
        // Earlier frames take longer, so completions arrive reversed.
        let transform = |frame: Frame<u64>| {
            let value = *frame.payload();
            thread::sleep(Duration::from_millis(40 - value * 10));
            Ok::<_, TransformError>(value)
        };
        let (processor, results) =
            ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(4), transform).unwrap();

        for i in 0..4 {
            processor.enqueue(frame(i)).unwrap();
        }
        let report = processor.shutdown();
        assert_eq!(report.joined, 4);

        let values: Vec<u64> = results
            .iter()
            .map(|p| p.into_result().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn failures_are_tagged_and_do_not_stall() {
        let buffer = BoundedFrameBuffer::new(8, BackpressurePolicy::BlockProducer).unwrap();
        let transform = |frame: Frame<u64>| {
            if frame.sequence() % 3 == 1 {
                Err(TransformError::failed("bad frame"))
            } else {
                Ok(frame.into_payload())
            }
        };
        let (processor, results) =
            ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(2), transform).unwrap();

        for i in 0..6 {
            processor.enqueue(frame(i)).unwrap();
        }
        processor.shutdown();

        let out: Vec<Processed<u64>> = results.iter().collect();
        assert_eq!(out.len(), 6);
        for (i, processed) in out.into_iter().enumerate() {
            assert_eq!(processed.sequence, i as u64);
            match processed.into_result() {
                Ok(v) => assert_eq!(v, i as u64),
                Err(PipelineError::TransformFailure { sequence, .. }) => {
                    assert_eq!(sequence % 3, 1)
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn panicking_transform_keeps_worker_alive() {
        let buffer = BoundedFrameBuffer::new(4, BackpressurePolicy::BlockProducer).unwrap();
        let transform = |frame: Frame<u64>| {
            if frame.sequence() == 0 {
                panic!("boom");
            }
            Ok::<_, TransformError>(frame.into_payload())
        };
        let (processor, results) =
            ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(1), transform).unwrap();

        processor.enqueue(frame(0)).unwrap();
        processor.enqueue(frame(1)).unwrap();
        processor.shutdown();

        let out: Vec<_> = results.iter().collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0].outcome,
            Outcome::Failed(TransformError::Panicked(msg)) if msg == "boom"
        ));
        assert!(out[1].is_completed());
    }

    #[test]
    fn shutdown_deadline_reports_abandoned_workers() {
        let buffer = BoundedFrameBuffer::new(2, BackpressurePolicy::BlockProducer).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let transform = {
            let started = started.clone();
            move |frame: Frame<u64>| {
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(500));
                Ok::<_, TransformError>(frame.into_payload())
            }
        };
        let (processor, _results) =
            ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(2), transform).unwrap();

        processor.enqueue(frame(0)).unwrap();
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        match processor.shutdown_timeout(Duration::from_millis(50)) {
            Err(PipelineError::ShutdownTimedOut { joined, abandoned }) => {
                assert_eq!(joined, 1);
                assert_eq!(abandoned, 1);
            }
            other => panic!("expected a timed-out shutdown, got {other:?}"),
        }
    }

    #[test]
    fn evictions_surface_in_order() {
        let buffer = BoundedFrameBuffer::new(1, BackpressurePolicy::DropOldest).unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let transform = {
            let gate = gate.clone();
            move |frame: Frame<u64>| {
                let _open = gate.lock().unwrap_or_else(PoisonError::into_inner);
                Ok::<_, TransformError>(frame.into_payload())
            }
        };
        let (processor, results) =
            ParallelOrderedProcessor::spawn(buffer, ProcessorOptions::new(1), transform).unwrap();

        processor.enqueue(frame(0)).unwrap();
        // Wait until the only worker holds frame 0, parked on the gate.
        while !processor.buffer().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        for i in 1..5 {
            processor.enqueue(frame(i)).unwrap();
        }
        drop(held);
        processor.shutdown();

        let out: Vec<_> = results.iter().collect();
        let sequences: Vec<u64> = out.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        let evicted = out
            .iter()
            .filter(|p| matches!(p.outcome, Outcome::Evicted))
            .count();
        assert_eq!(evicted, 3);
        assert!(out[0].is_completed());
        assert!(out[4].is_completed());
    }
}
