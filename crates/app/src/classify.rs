//! Wires camera, engine and pipeline together and runs the presentation loop.

use std::{
    io::{self, BufRead},
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, select, unbounded};
use ml_core::EngineFactory;
use tracing::{info, warn};
use video_ingest::{CameraProvider, LensSwitcher, PixelFormat, SyntheticCamera};
use vision::{
    ClassifyConfig, EngineManager, FrameIngest, FrameSource, LifecycleBinder, PresentationEvent,
    ResizeFilter, ResultPublisher, telemetry,
};

use crate::{
    cli::OutputMode,
    commands::{Command, HELP},
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Run until `quit`, end of stdin or Ctrl+C.
pub fn run(config: ClassifyConfig, output: OutputMode) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry, config.verbose);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let engines = Arc::new(EngineManager::new(build_factory(&config)?));
    // A rejected startup configuration is reported and the stream runs unclassified.
    if let Err(err) = engines.configure(config.device_config) {
        println!("{err}");
    }

    let (publisher, presentation) = ResultPublisher::new(config.threshold);
    let camera = build_camera(&config)?;
    let ingest = FrameIngest::new(config.input_size, ResizeFilter::default());
    let mut binder = LifecycleBinder::new(
        camera,
        engines,
        Arc::new(publisher),
        ingest,
        config.teardown_timeout,
    );
    binder.activate().context("failed to start classification")?;

    let commands = spawn_command_reader()?;
    let mut display = Display::new(output);
    println!("Classifying ({}); type `help` for commands", config.device_config);

    while !shutdown.load(Ordering::SeqCst) {
        select! {
            recv(presentation.channel()) -> event => match event {
                Ok(event) => display.show(&event),
                Err(_) => break,
            },
            recv(commands) -> line => match line {
                Ok(line) => {
                    if !handle_line(&mut binder, &config, &line) {
                        break;
                    }
                }
                Err(_) => {
                    info!("stdin closed; stopping");
                    break;
                }
            },
            default(SHUTDOWN_POLL) => {}
        }
    }

    let stats = binder.stats();
    binder.shutdown().context("failed to stop classification")?;
    info!(
        "Stopped after {} classification(s), {} superseded frame(s)",
        stats.classified, stats.superseded
    );

    if config.print_metrics {
        if let Some(handle) = telemetry::prometheus_handle() {
            println!("{}", handle.render());
        }
    }
    Ok(())
}

/// Apply one stdin line. Returns false when the user asked to quit.
fn handle_line(binder: &mut LifecycleBinder, config: &ClassifyConfig, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(err) => {
            println!("{err}");
            return true;
        }
    };

    match command {
        Command::Quit => return false,
        Command::Help => println!("{HELP}"),
        Command::Pause => match binder.deactivate() {
            Ok(()) => println!("Paused"),
            Err(err) => println!("Pause incomplete: {err}"),
        },
        Command::Resume => match binder.activate() {
            Ok(()) => println!("Resumed"),
            Err(err) => println!("Cannot resume: {err}"),
        },
        Command::SwitchLens => match binder.switch_lens() {
            Ok(lens) => println!("Using {lens} camera"),
            Err(err) => println!("Cannot switch camera: {err}"),
        },
        Command::Status => {
            let engine = match binder.engines().active_config() {
                Some(active) => active.to_string(),
                None => "no classifier".to_owned(),
            };
            let stats = binder.stats();
            println!(
                "{} | {} lens | {engine} | classified={} superseded={} dropped={} failed={}",
                if binder.is_active() { "active" } else { "paused" },
                binder.lens(),
                stats.classified,
                stats.superseded,
                stats.dropped,
                stats.failed,
            );
        }
        Command::Device(_) | Command::Model(_) | Command::Threads(_) => {
            let current = binder
                .engines()
                .active_config()
                .unwrap_or(config.device_config);
            if let Some(requested) = command.reconfigure(current) {
                match binder.configure(requested) {
                    Ok(id) => println!("Classifier {id} ready ({requested})"),
                    Err(err) => println!("{err}"),
                }
            }
        }
    }
    true
}

/// Prints results; in text mode only when the shown label changes.
struct Display {
    output: OutputMode,
    showing: Option<String>,
}

impl Display {
    fn new(output: OutputMode) -> Self {
        Self {
            output,
            showing: None,
        }
    }

    fn show(&mut self, event: &PresentationEvent) {
        if self.output == OutputMode::Json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("Failed to encode event: {err}"),
            }
            return;
        }

        match event {
            PresentationEvent::Result(result) => {
                let label = &result.recognition.label;
                if self.showing.as_ref() != Some(label) {
                    println!("{result}");
                    self.showing = Some(label.clone());
                }
            }
            PresentationEvent::Clear { .. } => {
                if self.showing.take().is_some() {
                    println!("-");
                }
            }
        }
    }
}

fn spawn_command_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    telemetry::spawn_thread("stdin-commands", move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })
    .context("failed to spawn stdin reader")?;
    Ok(rx)
}

#[cfg(feature = "with-tch")]
fn build_factory(config: &ClassifyConfig) -> Result<Arc<dyn EngineFactory>> {
    if config.input_size != ml_core::INPUT_SIZE {
        warn!(
            "TorchScript models expect {0}x{0} input; --input-size {1} will fail inference",
            ml_core::INPUT_SIZE,
            config.input_size
        );
    }
    Ok(Arc::new(ml_core::TorchEngineFactory::new(
        &config.model_dir,
        &config.labels_path,
    )))
}

#[cfg(not(feature = "with-tch"))]
fn build_factory(_config: &ClassifyConfig) -> Result<Arc<dyn EngineFactory>> {
    anyhow::bail!("live-classify was built without an inference backend; rebuild with `--features with-tch`")
}

fn build_camera(config: &ClassifyConfig) -> Result<Box<dyn CameraProvider>> {
    match &config.source {
        FrameSource::Synthetic => {
            let synthetic = |lens| {
                Box::new(SyntheticCamera::new(
                    lens,
                    config.capture_width,
                    config.capture_height,
                    PixelFormat::Nv21,
                    config.fps,
                )) as Box<dyn CameraProvider>
            };
            Ok(Box::new(LensSwitcher::with_default(
                synthetic(video_ingest::LensPosition::Front),
                synthetic(video_ingest::LensPosition::Back),
                config.lens,
            )))
        }
        FrameSource::Device(uri) => open_device(config, uri),
    }
}

#[cfg(feature = "opencv")]
fn open_device(config: &ClassifyConfig, uri: &str) -> Result<Box<dyn CameraProvider>> {
    use video_ingest::{LensPosition, OpenCvCamera};

    let size = (config.capture_width, config.capture_height);
    let fps = f64::from(config.fps);
    let Some(front_uri) = config.front_source.as_deref() else {
        return Ok(Box::new(OpenCvCamera::new(uri, config.lens, size, fps)));
    };

    let switcher = LensSwitcher::with_default(
        Box::new(OpenCvCamera::new(front_uri, LensPosition::Front, size, fps)),
        Box::new(OpenCvCamera::new(uri, LensPosition::Back, size, fps)),
        config.lens,
    );
    if !switcher.can_switch() {
        warn!("Only one camera is available; lens switching disabled");
    }
    Ok(Box::new(switcher))
}

#[cfg(not(feature = "opencv"))]
fn open_device(_config: &ClassifyConfig, uri: &str) -> Result<Box<dyn CameraProvider>> {
    anyhow::bail!("camera source {uri:?} needs the `opencv` feature; use --source synthetic")
}
