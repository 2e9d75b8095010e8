//! The per-frame processing step run by the workers

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::capture::{Frame, Image};
use crate::error::TransformError;
use crate::TransformConfig;

/// Processing applied to every frame by the worker pool.
///
/// Takes the frame by value: if the transform does not carry the payload
/// into its output, the payload is released when the frame drops, on the
/// error path as well.
pub trait Transform<P, R>: Send + Sync + 'static {
    fn apply(&self, frame: Frame<P>) -> Result<R, TransformError>;
}

impl<P, R, F> Transform<P, R> for F
where
    F: Fn(Frame<P>) -> Result<R, TransformError> + Send + Sync + 'static,
{
    fn apply(&self, frame: Frame<P>) -> Result<R, TransformError> {
        self(frame)
    }
}

/// Summary produced by [`SimulatedTransform`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    /// Mean sample value across the whole buffer
    pub mean_level: f64,
}

/// Stand-in for an expensive image algorithm: sleeps for a fixed latency
/// plus random jitter, optionally fails, then reduces the image to a
/// [`FrameSummary`].
#[derive(Debug, Clone)]
pub struct SimulatedTransform {
    latency: Duration,
    jitter: Duration,
    failure_rate: f64,
}

impl SimulatedTransform {
    pub fn new(latency: Duration, jitter: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            jitter,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self::new(
            Duration::from_millis(config.latency_ms),
            Duration::from_millis(config.jitter_ms),
            config.failure_rate,
        )
    }

    fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_nanos() as u64);
        self.latency + Duration::from_nanos(extra)
    }
}

impl Transform<Image, FrameSummary> for SimulatedTransform {
    fn apply(&self, frame: Frame<Image>) -> Result<FrameSummary, TransformError> {
        thread::sleep(self.delay());

        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(TransformError::failed(format!(
                "simulated failure on frame {}",
                frame.sequence()
            )));
        }

        let image = frame.payload();
        let expected = image.width as usize * image.height as usize * image.bytes_per_pixel();
        if image.data.len() != expected {
            return Err(TransformError::failed(format!(
                "frame {} carries {} bytes, expected {}",
                frame.sequence(),
                image.data.len(),
                expected
            )));
        }

        let mean_level = if image.data.is_empty() {
            0.0
        } else {
            image.data.iter().map(|&b| f64::from(b)).sum::<f64>() / image.data.len() as f64
        };

        Ok(FrameSummary {
            timestamp: frame.timestamp(),
            width: image.width,
            height: image.height,
            mean_level,
        })
    }
}
