//! Synthetic frame source running at a fixed nominal rate

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, instrument};

use crate::capture::frame::{Frame, Image};
use crate::error::{PipelineError, Result};
use crate::SensorConfig;

/// Produces moving grey-level test images at the configured frame rate.
///
/// Stands in for camera hardware: the pipeline only ever sees the payload
/// and the capture timestamp.
pub struct SyntheticSensor {
    config: SensorConfig,
    ticker: Option<Interval>,
    started: Instant,
    frames: u64,
}

impl SyntheticSensor {
    pub fn new(config: SensorConfig) -> Result<Self> {
        if config.fps == 0 || Duration::from_secs(1) / config.fps == Duration::ZERO {
            return Err(PipelineError::InvalidConfiguration(format!(
                "sensor fps must be between 1 and 1000000000, got {}",
                config.fps
            )));
        }
        if config.width == 0 || config.height == 0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "sensor resolution {}x{} is empty",
                config.width, config.height
            )));
        }

        info!(
            "Sensor mode: {}x{} {:?} @ {} fps",
            config.width, config.height, config.format, config.fps
        );

        Ok(Self {
            config,
            ticker: None,
            started: Instant::now(),
            frames: 0,
        })
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.config.fps
    }

    /// Start ticking at the nominal rate. Must run inside a Tokio runtime.
    pub fn start_stream(&mut self) {
        let mut ticker = interval(self.frame_interval());
        // A slow consumer makes us skip ticks, like a real sensor dropping
        // frames, instead of bursting to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        self.started = Instant::now();
        info!("Sensor stream started, interval {:?}", self.frame_interval());
    }

    /// Wait for the next tick and produce a frame stamped with its capture
    /// time relative to stream start.
    #[instrument(skip(self))]
    pub async fn capture_frame(&mut self) -> Result<Frame<Image>> {
        let ticker = self
            .ticker
            .as_mut()
            .ok_or(PipelineError::InvalidState("sensor stream not started"))?;
        ticker.tick().await;

        let timestamp = self.started.elapsed();
        let image = self.render(self.frames);
        self.frames += 1;

        Ok(Frame::new(image, timestamp))
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames
    }

    /// Horizontal gradient that scrolls one column per frame
    fn render(&self, index: u64) -> Image {
        let SensorConfig {
            width,
            height,
            format,
            ..
        } = self.config;
        let bpp = format.bytes_per_pixel();
        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);

        for _ in 0..height {
            for x in 0..width {
                let level = ((u64::from(x) + index) % 256) as u8;
                data.extend(std::iter::repeat(level).take(bpp));
            }
        }

        Image {
            data: Bytes::from(data),
            width,
            height,
            format,
        }
    }
}
