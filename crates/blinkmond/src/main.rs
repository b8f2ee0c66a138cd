use anyhow::{Context, Result};
use blinkmon_core::{DeferredProvider, FaceMeshProvider, LiveSeriesBuffer};
use blinkmon_hw::JpegFrameEncoder;
use tokio::time::{Instant, Interval};
use tracing_subscriber::EnvFilter;

mod config;
mod pipeline;
mod session;
mod transport;

#[cfg(test)]
mod testutil;

use config::Config;
use pipeline::FramePipeline;
use session::{SessionController, SessionError, SessionStatus, SessionSummary};

enum Wake {
    Finished(Result<SessionSummary, SessionError>),
    Shutdown,
    Stats,
}

/// Resolves on the next stats tick, or never when stats are disabled.
async fn stats_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_status(status: &SessionStatus) {
    let stats = &status.stats;
    tracing::info!(
        session = ?status.session_id,
        state = ?status.blink_state,
        blinks = status.total_blink_count,
        transport = ?status.transport,
        frames = stats.frames_processed,
        sent = stats.frames_sent,
        dropped = stats.frames_dropped,
        null = stats.null_samples,
        points = status.series.points.len(),
        value_extent = ?status.series.value_extent,
        "session status"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("blinkmond starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        device = %config.camera_device,
        endpoint = %config.endpoint_url,
        model = %config.model_path.display(),
        "configuration loaded"
    );

    // Samples stay empty until the model finishes loading.
    let model_path = config.model_path.to_string_lossy().into_owned();
    let layout = config.model_layout;
    let provider = DeferredProvider::spawn(move || FaceMeshProvider::load(&model_path, layout))
        .context("failed to spawn model loader")?;

    let pipeline = FramePipeline::new(
        provider,
        JpegFrameEncoder::new(config.jpeg_quality),
        config.blink,
        LiveSeriesBuffer::new(config.series_capacity, config.value_range),
    );
    let mut stats = config
        .stats_interval()
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut controller = SessionController::new(config, pipeline);

    let id = controller.start().await?;
    tracing::info!(session = %id, "blinkmond ready");

    let summary = loop {
        let wake = tokio::select! {
            summary = controller.finished() => Wake::Finished(summary),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                Wake::Shutdown
            }
            _ = stats_tick(&mut stats) => Wake::Stats,
        };
        match wake {
            Wake::Finished(summary) => break summary?,
            Wake::Shutdown => {
                tracing::info!("blinkmond shutting down");
                break controller.stop().await?;
            }
            Wake::Stats => log_status(&controller.status().await?),
        }
    };

    tracing::info!(
        session = %summary.session_id,
        started_at = %summary.started_at,
        blinks = summary.total_blink_count,
        stats = ?summary.stats,
        "final summary"
    );
    log_status(&controller.status().await?);

    match summary.error {
        Some(e) => Err(e).context("session ended unexpectedly"),
        None => Ok(()),
    }
}
