//! Framepipe demo: synthetic sensor through the ordered frame pipeline

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use framepipe::capture::SyntheticSensor;
use framepipe::pipeline::{FrameSummary, SimulatedTransform};
use framepipe::{utils, Config, FramePipeline, Image, PipelineError};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing("framepipe=debug");

    info!("Framepipe launching...");

    // Load configuration
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    info!("Configuration: {:?}", config);

    let transform = SimulatedTransform::from_config(&config.transform);
    let pipeline: Arc<FramePipeline<Image, FrameSummary>> =
        Arc::new(FramePipeline::new(&config.pipeline, transform)?);

    let mut sensor = SyntheticSensor::new(config.sensor.clone())?;
    sensor.start_stream();

    // Spawn capture task
    let capture_handle = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            loop {
                match sensor.capture_frame().await {
                    Ok(frame) => {
                        // Submitting may park the thread under BlockProducer.
                        let submitted = tokio::task::block_in_place(|| pipeline.submit_frame(frame));
                        match submitted {
                            Ok(_) => {}
                            Err(PipelineError::Closed) | Err(PipelineError::InvalidState(_)) => {
                                info!("Pipeline closed, capture stopping");
                                break;
                            }
                            Err(e) => {
                                error!("Failed to submit frame: {}", e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Capture error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            sensor.frames_captured()
        })
    };

    // Report rates once a second
    let report_handle = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let stats = pipeline.stats();
                let latest = pipeline.latest();
                info!(
                    "in {} | out {} | completed {} failed {} evicted {} queued {} | latest #{}",
                    utils::format_fps(stats.input_fps),
                    utils::format_fps(stats.output_fps),
                    stats.completed,
                    stats.failed,
                    stats.evicted,
                    stats.queued,
                    latest.as_ref().map_or(-1, |c| c.sequence as i64),
                );
            }
        })
    };

    match config.sensor.run_seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run time elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    report_handle.abort();
    let shutdown = {
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || pipeline.shutdown()).await?
    };
    match shutdown {
        Ok(report) => info!("Workers joined: {}", report.joined),
        Err(e) => warn!("Shutdown incomplete: {}", e),
    }

    let captured = capture_handle.await?;
    let stats = pipeline.stats();
    info!(
        "Captured {} frames, completed {}, failed {}, evicted {}, reorder high water {}",
        captured, stats.completed, stats.failed, stats.evicted, stats.reorder_high_water
    );

    info!("Framepipe shutting down");
    Ok(())
}
