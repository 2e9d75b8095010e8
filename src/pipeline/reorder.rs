//! Restores arrival order on results that complete out of order

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use flume::Sender;
use tracing::{debug, warn};

use super::processor::{Outcome, Processed};

/// Holds early completions until every lower sequence number has been
/// emitted, then releases them downstream in sequence order.
///
/// Workers are admitted to a frame only while it lies within `window`
/// sequences of the next one due, so at most `window` transform results are
/// ever parked here. Eviction markers carry no payload and are not gated.
pub(crate) struct Reorderer<R> {
    state: Mutex<State<R>>,
    advanced: Condvar,
    window: u64,
}

struct State<R> {
    next: u64,
    pending: BTreeMap<u64, Outcome<R>>,
    high_water: usize,
    /// Dropped on `finish` so downstream sees end-of-stream.
    out: Option<Sender<Processed<R>>>,
    finished: bool,
}

impl<R> Reorderer<R> {
    pub(crate) fn new(out: Sender<Processed<R>>, window: usize) -> Self {
        Self {
            state: Mutex::new(State {
                next: 0,
                pending: BTreeMap::new(),
                high_water: 0,
                out: Some(out),
                finished: false,
            }),
            advanced: Condvar::new(),
            window: window.max(1) as u64,
        }
    }

    /// Block until `sequence` is within the reorder window, or the output
    /// has finished.
    pub(crate) fn admit(&self, sequence: u64) {
        let mut state = self.lock();
        while sequence >= state.next.saturating_add(self.window) && !state.finished {
            state = self
                .advanced
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record the outcome for `sequence` and emit everything that is now
    /// contiguous with what was already emitted.
    pub(crate) fn complete(&self, sequence: u64, outcome: Outcome<R>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if sequence < state.next || state.pending.contains_key(&sequence) {
            warn!(sequence, "Late or duplicate completion ignored");
            return;
        }

        state.pending.insert(sequence, outcome);
        state.high_water = state.high_water.max(state.pending.len());
        let before = state.next;

        // Emission happens under the lock so two workers can never interleave
        // their releases out of order.
        while let Some(outcome) = state.pending.remove(&state.next) {
            let processed = Processed {
                sequence: state.next,
                outcome,
            };
            state.next += 1;
            emit(&state.out, processed);
        }

        let advanced = state.next != before;
        drop(guard);
        if advanced {
            self.advanced.notify_all();
        }
    }

    /// Mark a frame that will never reach a worker.
    pub(crate) fn skip(&self, sequence: u64) {
        self.complete(sequence, Outcome::Evicted);
    }

    /// Flush whatever is left and close the output.
    ///
    /// Anything still pending here is behind a gap that can no longer be
    /// filled, which only happens when workers were abandoned.
    pub(crate) fn finish(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            warn!(
                next = state.next,
                stranded = pending.len(),
                "Flushing results stranded behind a sequence gap"
            );
        }
        for (sequence, outcome) in pending {
            emit(&state.out, Processed { sequence, outcome });
            state.next = sequence + 1;
        }
        state.out = None;
        state.finished = true;
        drop(guard);
        self.advanced.notify_all();
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn high_water(&self) -> usize {
        self.lock().high_water
    }

    fn lock(&self) -> MutexGuard<'_, State<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn emit<R>(out: &Option<Sender<Processed<R>>>, processed: Processed<R>) {
    match out {
        Some(tx) => {
            if let Err(err) = tx.send(processed) {
                debug!(sequence = err.0.sequence, "Result receiver gone, releasing result");
            }
        }
        None => debug!(sequence = processed.sequence, "Output finished, releasing late result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn sequences(rx: &flume::Receiver<Processed<u64>>) -> Vec<u64> {
        rx.try_iter().map(|p| p.sequence).collect()
    }

    #[test]
    fn in_order_completions_pass_straight_through() {
        let (tx, rx) = flume::unbounded();
        let reorder = Reorderer::new(tx, 4);
        for i in 0..4 {
            reorder.complete(i, Outcome::Completed(i * 10));
        }
        assert_eq!(sequences(&rx), vec![0, 1, 2, 3]);
        assert_eq!(reorder.high_water(), 1);
    }

    #[test]
    fn early_completions_wait_for_the_gap() {
        let (tx, rx) = flume::unbounded();
        let reorder = Reorderer::new(tx, 4);

        reorder.complete(2, Outcome::Completed(2));
        reorder.complete(1, Outcome::Completed(1));
        assert!(sequences(&rx).is_empty());
        assert_eq!(reorder.pending(), 2);

        reorder.complete(0, Outcome::Completed(0));
        assert_eq!(sequences(&rx), vec![0, 1, 2]);
        assert_eq!(reorder.pending(), 0);
        assert_eq!(reorder.high_water(), 3);
    }

    #[test]
    fn skipped_sequences_become_eviction_markers() {
        let (tx, rx) = flume::unbounded();
        let reorder = Reorderer::new(tx, 4);

        reorder.complete(1, Outcome::Completed(1));
        reorder.skip(0);

        let out: Vec<_> = rx.try_iter().collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].outcome, Outcome::Evicted));
        assert!(matches!(out[1].outcome, Outcome::Completed(1)));
    }

    #[test]
    fn duplicates_are_ignored() {
        let (tx, rx) = flume::unbounded();
        let reorder = Reorderer::new(tx, 4);
        reorder.complete(0, Outcome::Completed(0));
        reorder.complete(0, Outcome::Completed(99));
        let out: Vec<_> = rx.try_iter().collect();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].outcome, Outcome::Completed(0)));
    }

    #[test]
    fn admission_waits_until_the_window_moves() {
        let (tx, rx) = flume::unbounded();
        let reorder = Arc::new(Reorderer::new(tx, 2));
        reorder.admit(0);
        reorder.admit(1);

        let (admitted_tx, admitted) = mpsc::channel();
        let waiter = {
            let reorder = reorder.clone();
            thread::spawn(move || {
                reorder.admit(2);
                admitted_tx.send(()).unwrap();
            })
        };
        assert!(admitted.recv_timeout(Duration::from_millis(100)).is_err());

        // Parking a later result does not move the window.
        reorder.complete(1, Outcome::Completed(1));
        assert!(admitted.recv_timeout(Duration::from_millis(50)).is_err());

        reorder.complete(0, Outcome::Completed(0));
        admitted.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(sequences(&rx), vec![0, 1]);
    }

    #[test]
    fn finish_releases_waiting_workers() {
        let (tx, _rx) = flume::unbounded::<Processed<u64>>();
        let reorder = Arc::new(Reorderer::new(tx, 1));
        let waiter = {
            let reorder = reorder.clone();
            thread::spawn(move || reorder.admit(5))
        };
        thread::sleep(Duration::from_millis(50));
        reorder.finish();
        waiter.join().unwrap();
    }

    #[test]
    fn finish_flushes_and_disconnects() {
        let (tx, rx) = flume::unbounded();
        let reorder = Reorderer::new(tx, 4);
        reorder.complete(3, Outcome::Completed(3));
        reorder.finish();

        assert_eq!(sequences(&rx), vec![3]);
        assert!(rx.recv().is_err());
    }
}
