pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use serde::{Deserialize, Serialize};
use tracing::info;

use capture::frame::PixelFormat;

pub use capture::{Frame, Image};
pub use error::{PipelineError, Result, TransformError};
pub use pipeline::{BackpressurePolicy, Completed, FramePipeline, PipelineStats};

/// Environment variables override file settings, e.g.
/// `FRAMEPIPE__PIPELINE__WORKERS=8`.
const ENV_PREFIX: &str = "FRAMEPIPE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub pipeline: PipelineConfig,
    pub transform: TransformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate of the source
    pub fps: u32,
    pub format: PixelFormat,
    /// How long the demo binary streams before shutting down; runs until
    /// Ctrl-C when unset
    pub run_seconds: Option<u64>,
}

/// Fixed at construction; the pipeline has no runtime reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub workers: usize,
    pub rate_window_ms: f64,
    pub pin_workers: bool,
    /// Deadline for draining workers on shutdown; waits indefinitely when unset
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    /// Probability in [0, 1] that a frame fails
    pub failure_rate: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Gray8,
            run_seconds: Some(10),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 8,
            backpressure: BackpressurePolicy::BlockProducer,
            workers: 4,
            rate_window_ms: 1_000.0,
            pin_workers: false,
            shutdown_timeout_ms: Some(2_000),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        // Roughly the cost of a slow per-frame algorithm at 30fps
        Self {
            latency_ms: 100,
            jitter_ms: 50,
            failure_rate: 0.0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "buffer_capacity must be at least 1".into(),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "workers must be at least 1".into(),
            ));
        }
        // Same conversion the pipeline performs at construction.
        pipeline::RateWindow::from_millis(self.rate_window_ms)?;
        Ok(())
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.pipeline.validate()?;
        Ok(config)
    }
}
