//! Intake behaviour when workers cannot keep up with the source

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framepipe::{
    utils, BackpressurePolicy, Frame, FramePipeline, PipelineConfig, PipelineError,
    TransformError,
};

fn config(capacity: usize, policy: BackpressurePolicy, workers: usize) -> PipelineConfig {
    PipelineConfig {
        buffer_capacity: capacity,
        backpressure: policy,
        workers,
        shutdown_timeout_ms: Some(5_000),
        ..PipelineConfig::default()
    }
}

#[test]
fn block_producer_waits_for_a_slow_consumer() {
    utils::init_tracing("framepipe=info");

    // The single worker holds each frame until the test lets it go.
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();
    let transform = {
        let gate = gate.clone();
        move |frame: Frame<u32>| {
            let _open = gate.lock().unwrap();
            Ok::<_, TransformError>(frame.into_payload())
        }
    };
    let pipeline = Arc::new(
        FramePipeline::new(&config(1, BackpressurePolicy::BlockProducer, 1), transform).unwrap(),
    );

    // Frame 0 goes to the worker, frame 1 fills the buffer.
    pipeline.submit_now(0).unwrap();
    while pipeline.stats().queued != 0 {
        thread::sleep(Duration::from_millis(1));
    }
    pipeline.submit_now(1).unwrap();

    let (tx, rx) = mpsc::channel();
    let producer = {
        let pipeline = pipeline.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let enqueued = pipeline.submit_now(2).unwrap();
            tx.send(started.elapsed()).unwrap();
            enqueued.sequence
        })
    };

    // Nothing has been dequeued, so the third submit must still be parked.
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

    drop(held);
    let waited = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(waited >= Duration::from_millis(150));
    assert_eq!(producer.join().unwrap(), 2);

    pipeline.shutdown().unwrap();
    let stats = pipeline.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.evicted, 0);
    assert_eq!(pipeline.latest().map(|c| c.value), Some(2));
}

#[test]
fn drop_oldest_never_blocks_and_accounts_for_every_frame() {
    const FRAMES: u64 = 100;
    const CAPACITY: usize = 4;

    let transform = |frame: Frame<u64>| {
        thread::sleep(Duration::from_millis(5));
        Ok::<_, TransformError>(frame.into_payload())
    };
    let pipeline =
        FramePipeline::new(&config(CAPACITY, BackpressurePolicy::DropOldest, 1), transform)
            .unwrap();

    let started = Instant::now();
    let mut evictions = 0;
    for i in 0..FRAMES {
        let enqueued = pipeline.submit(i, Duration::from_millis(i)).unwrap();
        assert_eq!(enqueued.sequence, i);
        if let Some(evicted) = enqueued.evicted {
            assert!(evicted < i);
            evictions += 1;
        }
    }
    // One worker at 5 ms a frame would need half a second to keep up.
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(evictions > 0);

    pipeline.shutdown().unwrap();
    let stats = pipeline.stats();
    assert_eq!(stats.submitted, FRAMES);
    assert_eq!(stats.evicted, evictions);
    assert_eq!(stats.completed + stats.evicted + stats.failed, FRAMES);
    assert_eq!(stats.last_sequence, Some(FRAMES - 1));
    // The newest frame is never the one dropped.
    assert_eq!(pipeline.latest().map(|c| c.sequence), Some(FRAMES - 1));
}

#[test]
fn submit_after_shutdown_is_rejected() {
    let transform = |frame: Frame<u8>| Ok::<_, TransformError>(frame.into_payload());
    let pipeline =
        FramePipeline::new(&config(2, BackpressurePolicy::BlockProducer, 2), transform).unwrap();

    pipeline.submit_now(7).unwrap();
    let report = pipeline.shutdown().unwrap();
    assert_eq!(report.joined, 2);
    assert_eq!(report.abandoned, 0);

    assert!(matches!(
        pipeline.submit_now(8),
        Err(PipelineError::InvalidState(_))
    ));
    assert_eq!(pipeline.latest().map(|c| c.value), Some(7));
}

#[test]
fn shutdown_deadline_reports_stuck_workers() {
    let (release, stuck) = mpsc::channel::<()>();
    let stuck = Mutex::new(stuck);
    let transform = move |frame: Frame<u8>| {
        if frame.sequence() == 0 {
            let _ = stuck.lock().unwrap().recv();
        }
        Ok::<_, TransformError>(frame.into_payload())
    };
    let config = PipelineConfig {
        shutdown_timeout_ms: Some(100),
        ..config(4, BackpressurePolicy::BlockProducer, 2)
    };
    let pipeline = FramePipeline::new(&config, transform).unwrap();

    pipeline.submit_now(0).unwrap();
    pipeline.submit_now(1).unwrap();

    let started = Instant::now();
    let result = pipeline.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        result,
        Err(PipelineError::ShutdownTimedOut {
            joined: 1,
            abandoned: 1
        })
    ));

    // Let the detached worker finish so the test process exits cleanly.
    release.send(()).unwrap();
}
