use anyhow::{bail, Context, Result};
use blinkmon_core::blink::{
    DEFAULT_EAR_THRESHOLD, DEFAULT_MAX_CONSECUTIVE_FRAMES, DEFAULT_MIN_CONSECUTIVE_FRAMES,
};
use blinkmon_core::series::DEFAULT_SERIES_CAPACITY;
use blinkmon_core::{BlinkConfig, BlinkStateMachine, EarSample, LiveSeriesBuffer, ValueRange};
use blinkmon_hw::{Camera, FrameEncoder, FrameSource, JpegFrameEncoder};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "blinkmon", about = "blinkmon blink monitoring CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        /// Camera device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(short = 'n', long, default_value_t = 30)]
        frames: usize,
        #[arg(long, default_value_t = 1280)]
        width: u32,
        #[arg(long, default_value_t = 720)]
        height: u32,
        /// Write the last frame as JPEG
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Replay a `timestamp,ear` trace through the blink detector
    Replay {
        /// CSV file; an empty ear column is a missing sample
        trace: PathBuf,
        #[arg(long, default_value_t = DEFAULT_EAR_THRESHOLD)]
        threshold: f64,
        #[arg(long, default_value_t = DEFAULT_MIN_CONSECUTIVE_FRAMES)]
        min_frames: u32,
        #[arg(long, default_value_t = DEFAULT_MAX_CONSECUTIVE_FRAMES)]
        max_frames: u32,
        #[arg(long, default_value_t = DEFAULT_SERIES_CAPACITY)]
        capacity: usize,
        #[arg(long, value_enum, default_value_t = RangeMode::Fixed)]
        range: RangeMode,
        /// Print the final series snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RangeMode {
    Fixed,
    Dynamic,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test {
            device,
            frames,
            width,
            height,
            save,
        } => camera_test(&device, frames, width, height, save.as_deref())?,
        Commands::Replay {
            trace,
            threshold,
            min_frames,
            max_frames,
            capacity,
            range,
            json,
        } => {
            let config = BlinkConfig {
                threshold,
                min_consecutive_frames: min_frames,
                max_consecutive_frames: max_frames,
            };
            let range = match range {
                RangeMode::Fixed => ValueRange::default(),
                RangeMode::Dynamic => ValueRange::Dynamic,
            };
            replay(&trace, config, capacity, range, json)?;
        }
    }

    Ok(())
}

fn camera_test(
    device: &str,
    frames: usize,
    width: u32,
    height: u32,
    save: Option<&Path>,
) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, width, height)?;
    println!(
        "Negotiated {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let mut dark = 0;
    let mut brightness_sum = 0.0f64;
    let mut last = None;
    for _ in 0..frames {
        let frame = camera.next_frame()?;
        brightness_sum += frame.avg_brightness() as f64;
        if frame.is_dark() {
            dark += 1;
        }
        last = Some(frame);
    }

    if frames > 0 {
        println!(
            "Captured {frames} frames: avg brightness {:.1}, {dark} dark",
            brightness_sum / frames as f64
        );
    }

    if let (Some(path), Some(frame)) = (save, last.as_ref()) {
        let bytes = JpegFrameEncoder::default().encode(frame)?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        println!("Saved frame {} to {}", frame.sequence, path.display());
    }
    drop(last);

    let outstanding = camera.outstanding_frames();
    println!("Outstanding frames after release: {outstanding}");
    camera.release();
    Ok(())
}

/// Parse `timestamp,ear` rows. A leading header row and blank lines are skipped.
fn parse_trace(text: &str) -> Result<Vec<EarSample>> {
    let mut samples = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((ts, ear)) = line.split_once(',') else {
            bail!("line {}: expected `timestamp,ear`", lineno + 1);
        };
        let Ok(timestamp) = ts.trim().parse::<f64>() else {
            if lineno == 0 {
                continue;
            }
            bail!("line {}: invalid timestamp {ts:?}", lineno + 1);
        };
        let ear = ear.trim();
        let value = match ear {
            "" | "null" | "nan" => None,
            v => Some(
                v.parse::<f64>()
                    .with_context(|| format!("line {}: invalid ear {v:?}", lineno + 1))?,
            ),
        };
        samples.push(EarSample::new(timestamp, value));
    }
    Ok(samples)
}

fn replay(
    path: &Path,
    config: BlinkConfig,
    capacity: usize,
    range: ValueRange,
    json: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let samples = parse_trace(&text)?;

    let mut machine = BlinkStateMachine::new(config);
    let mut buffer = LiveSeriesBuffer::new(capacity, range);
    buffer.start();

    for sample in &samples {
        let out = machine.step(*sample);
        for event in out.events() {
            if !json {
                println!("{:>14.3}  {:?}", event.timestamp, event.kind);
            }
        }
        if out.prolonged && !json {
            println!("{:>14.3}  prolonged closure", out.timestamp);
        }
        buffer.append(sample.timestamp, sample.value);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&buffer.snapshot())?);
        return Ok(());
    }

    println!("Samples:     {}", samples.len());
    println!("Blinks:      {}", machine.total_blink_count());
    println!("Buffered:    {}", buffer.len());
    match buffer.time_extent() {
        Some((start, end)) => println!("Time range:  {start:.3} .. {end:.3}"),
        None => println!("Time range:  (empty)"),
    }
    let (lo, hi) = buffer.value_extent();
    println!("Value range: {lo:.3} .. {hi:.3}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_with_header_and_gaps() {
        let samples = parse_trace("timestamp,ear\n0.0,0.35\n0.033,\n\n0.066,0.12\n").unwrap();
        assert_eq!(
            samples,
            vec![
                EarSample::new(0.0, Some(0.35)),
                EarSample::new(0.033, None),
                EarSample::new(0.066, Some(0.12)),
            ]
        );
    }

    #[test]
    fn test_parse_trace_rejects_garbage() {
        assert!(parse_trace("0.0,0.3\nabc,0.3\n").is_err());
        assert!(parse_trace("0.0;0.3\n").is_err());
        assert!(parse_trace("0.0,wide\n").is_err());
    }

    #[test]
    fn test_replayed_trace_counts_blink() {
        let samples = parse_trace("0,0.35\n1,0.20\n2,0.18\n3,0.15\n4,0.10\n5,0.40\n").unwrap();
        let mut machine = BlinkStateMachine::default();
        let ends = samples.iter().filter(|s| machine.step(**s).end).count();
        assert_eq!(ends, 1);
        assert_eq!(machine.total_blink_count(), 1);
    }
}
