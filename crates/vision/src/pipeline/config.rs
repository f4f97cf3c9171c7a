//! Configuration parsing for the classification pipeline.
//!
//! This module owns translation of CLI arguments into a `ClassifyConfig`
//! which the binary and the pipeline use without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use ml_core::{DeviceConfig, ExecutionDevice, INPUT_SIZE, ModelVariant};
use video_ingest::LensPosition;

use crate::pipeline::publisher::CONFIDENCE_THRESHOLD;

const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum FrameSource {
    /// Built-in moving test pattern on both lenses.
    Synthetic,
    /// OpenCV device index, file path or stream URI.
    Device(String),
}

impl FrameSource {
    pub(crate) fn from_arg(source: &str) -> Self {
        if source.eq_ignore_ascii_case("synthetic") {
            FrameSource::Synthetic
        } else {
            FrameSource::Device(source.to_owned())
        }
    }
}

#[derive(Clone, Debug)]
/// Validated configuration shared by the binary and the pipeline.
pub struct ClassifyConfig {
    pub source: FrameSource,
    /// Second device for the front lens, when the source is a real camera.
    pub front_source: Option<String>,
    /// Directory holding the TorchScript model variants.
    pub model_dir: PathBuf,
    /// One label per line, indexed by class id.
    pub labels_path: PathBuf,
    /// Engine configuration applied at startup.
    pub device_config: DeviceConfig,
    /// Side of the square classifier input.
    pub input_size: u32,
    /// Top recognitions at or below this are not shown.
    pub threshold: f32,
    /// Bound on waiting for the worker during deactivation.
    pub teardown_timeout: Duration,
    pub capture_width: u32,
    pub capture_height: u32,
    pub fps: u32,
    pub lens: LensPosition,
    pub verbose: bool,
    /// Print Prometheus metrics on exit.
    pub print_metrics: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the classifier.
#[derive(Debug, Args)]
pub struct ClassifyCliArgs {
    /// Frame source: `synthetic` or an OpenCV device index / URI.
    #[arg(long = "source", value_name = "URI", default_value = "synthetic")]
    pub source: String,
    /// Device for the front lens (real cameras only).
    #[arg(long = "front-source", value_name = "URI")]
    pub front_source: Option<String>,
    /// Directory containing the model files.
    #[arg(long = "model-dir", value_name = "DIR", default_value = "models")]
    pub model_dir: PathBuf,
    /// Label file; defaults to `labels.txt` inside the model directory.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Model variant: float or quantized.
    #[arg(long = "model", value_name = "VARIANT")]
    pub model: Option<ModelVariant>,
    /// Execution device: cpu or gpu.
    #[arg(long = "device", value_name = "DEVICE")]
    pub device: Option<ExecutionDevice>,
    /// Inference threads.
    #[arg(long = "threads", value_name = "N")]
    pub threads: Option<usize>,
    /// Classifier input size in pixels.
    #[arg(long = "input-size", value_name = "PX")]
    pub input_size: Option<u32>,
    /// Minimum top confidence to display (exclusive).
    #[arg(long = "threshold", value_name = "P")]
    pub threshold: Option<f32>,
    /// Milliseconds to wait for the worker when pausing.
    #[arg(long = "teardown-timeout-ms", value_name = "MS")]
    pub teardown_timeout_ms: Option<u64>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Capture rate.
    #[arg(long = "fps", value_name = "N")]
    pub fps: Option<u32>,
    /// Starting lens: front or back.
    #[arg(long = "lens", value_name = "LENS")]
    pub lens: Option<LensPosition>,
    /// Enable verbose logging (per-frame details).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Print Prometheus metrics on exit.
    #[arg(long = "print-metrics", action = clap::ArgAction::SetTrue)]
    pub print_metrics: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ClassifyCliArgs> for ClassifyConfig {
    type Error = anyhow::Error;

    fn try_from(args: ClassifyCliArgs) -> Result<Self> {
        let source = FrameSource::from_arg(&args.source);
        if source == FrameSource::Synthetic && args.front_source.is_some() {
            bail!("--front-source only applies to camera sources");
        }

        let defaults = DeviceConfig::default();
        let num_threads = args.threads.unwrap_or(defaults.num_threads);
        if num_threads == 0 {
            bail!("--threads must be at least 1");
        }
        // GPU availability and quantized-on-GPU are checked when the engine is built.
        let device_config = DeviceConfig::new(
            args.model.unwrap_or(defaults.model),
            args.device.unwrap_or(defaults.device),
            num_threads,
        );

        let input_size = args.input_size.unwrap_or(INPUT_SIZE);
        if input_size == 0 {
            bail!("--input-size must be positive");
        }

        let threshold = args.threshold.unwrap_or(CONFIDENCE_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            bail!("--threshold must be between 0 and 1");
        }

        let teardown_timeout_ms = args
            .teardown_timeout_ms
            .unwrap_or(DEFAULT_TEARDOWN_TIMEOUT_MS);
        if teardown_timeout_ms == 0 {
            bail!("--teardown-timeout-ms must be at least 1");
        }

        let capture_width = args.width.unwrap_or(DEFAULT_CAPTURE_WIDTH);
        let capture_height = args.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT);
        if capture_width == 0 || capture_height == 0 {
            bail!("Capture width and height must be positive integers");
        }

        let fps = args.fps.unwrap_or(DEFAULT_FPS);
        if fps == 0 {
            bail!("--fps must be at least 1");
        }

        let labels_path = args
            .labels
            .unwrap_or_else(|| args.model_dir.join("labels.txt"));

        Ok(Self {
            source,
            front_source: args.front_source,
            model_dir: args.model_dir,
            labels_path,
            device_config,
            input_size,
            threshold,
            teardown_timeout: Duration::from_millis(teardown_timeout_ms),
            capture_width,
            capture_height,
            fps,
            lens: args.lens.unwrap_or(LensPosition::Back),
            verbose: args.verbose,
            print_metrics: args.print_metrics,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
