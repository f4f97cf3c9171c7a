#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use ml_core::{
    ClassificationResult, DeviceConfig, EngineFactory, EngineInitError, InferenceEngine,
    InferenceError, PreprocessedImage, Recognition,
};
use video_ingest::{CameraProvider, CaptureError, FrameSink, LensPosition, PixelFormat, RawFrame};
use vision::{
    EngineManager, FrameIngest, LifecycleBinder, PresentationReceiver, ResizeFilter,
    ResultPublisher,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Blocks engines inside `recognize_image` until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::default()
    }

    pub fn opened() -> Arc<Self> {
        let gate = Self::closed();
        gate.open();
        gate
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }

    /// Number of classifications that have started so far.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

#[derive(Default)]
pub struct Ledger {
    pub created: Vec<u64>,
    pub closed: HashMap<u64, usize>,
    /// Engines closed while one of their classifications was running.
    pub closed_in_use: usize,
}

impl Ledger {
    /// Engines created and not yet closed.
    pub fn live(&self) -> usize {
        self.created.len() - self.closed.len()
    }
}

#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    max: AtomicUsize,
}

struct FakeEngine {
    serial: u64,
    label: String,
    confidence: f32,
    gate: Arc<Gate>,
    ledger: Arc<Mutex<Ledger>>,
    busy: Arc<AtomicUsize>,
    concurrency: Arc<Concurrency>,
}

impl InferenceEngine for FakeEngine {
    fn recognize_image(
        &mut self,
        _image: &PreprocessedImage,
    ) -> Result<ClassificationResult, InferenceError> {
        let running = self.concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.concurrency.max.fetch_max(running, Ordering::SeqCst);
        self.busy.fetch_add(1, Ordering::SeqCst);

        self.gate.pass();

        self.busy.fetch_sub(1, Ordering::SeqCst);
        self.concurrency.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ClassificationResult::new(vec![
            Recognition::new(self.serial.to_string(), self.label.clone(), self.confidence),
            Recognition::new("999", "background", 0.05),
        ]))
    }

    fn close(&mut self) {
        let mut ledger = self.ledger.lock().unwrap();
        if self.busy.load(Ordering::SeqCst) > 0 {
            ledger.closed_in_use += 1;
        }
        *ledger.closed.entry(self.serial).or_default() += 1;
    }
}

/// Factory producing engines that report a fixed label through a shared gate.
pub struct FakeFactory {
    pub gpu: bool,
    pub gate: Arc<Gate>,
    pub ledger: Arc<Mutex<Ledger>>,
    label: Mutex<(String, f32)>,
    concurrency: Arc<Concurrency>,
}

impl FakeFactory {
    pub fn new(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gpu: false,
            gate,
            ledger: Arc::default(),
            label: Mutex::new(("cat".to_owned(), 0.82)),
            concurrency: Arc::default(),
        })
    }

    /// Label and confidence reported by engines created from now on.
    pub fn set_output(&self, label: &str, confidence: f32) {
        *self.label.lock().unwrap() = (label.to_owned(), confidence);
    }

    /// Highest number of classifications observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.concurrency.max.load(Ordering::SeqCst)
    }
}

impl EngineFactory for FakeFactory {
    fn gpu_available(&self) -> bool {
        self.gpu
    }

    fn create(&self, _config: &DeviceConfig) -> Result<Box<dyn InferenceEngine>, EngineInitError> {
        let mut ledger = self.ledger.lock().unwrap();
        let serial = ledger.created.len() as u64 + 1;
        ledger.created.push(serial);
        let (label, confidence) = self.label.lock().unwrap().clone();
        Ok(Box::new(FakeEngine {
            serial,
            label,
            confidence,
            gate: self.gate.clone(),
            ledger: self.ledger.clone(),
            busy: Arc::default(),
            concurrency: self.concurrency.clone(),
        }))
    }
}

/// Camera whose frames are pushed by the test, synchronously through the sink.
pub struct ManualCamera {
    lens: LensPosition,
    sink: Arc<Mutex<Option<FrameSink>>>,
    starts: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ManualFeed {
    sink: Arc<Mutex<Option<FrameSink>>>,
    starts: Arc<AtomicUsize>,
}

impl ManualCamera {
    pub fn new() -> (Self, ManualFeed) {
        let sink = Arc::new(Mutex::new(None));
        let starts = Arc::new(AtomicUsize::new(0));
        let camera = Self {
            lens: LensPosition::Back,
            sink: sink.clone(),
            starts: starts.clone(),
        };
        (camera, ManualFeed { sink, starts })
    }
}

impl CameraProvider for ManualCamera {
    fn lens(&self) -> LensPosition {
        self.lens
    }

    fn is_running(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        let mut slot = self.sink.lock().unwrap();
        if slot.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        *slot = Some(sink);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        *self.sink.lock().unwrap() = None;
        Ok(())
    }

    fn switch_lens(&mut self) -> Result<LensPosition, CaptureError> {
        self.lens = self.lens.opposite();
        Ok(self.lens)
    }
}

impl ManualFeed {
    /// Deliver one frame stamped `timestamp_ms`. False when the camera is stopped.
    pub fn push(&self, timestamp_ms: i64) -> bool {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => {
                sink(rgb_frame(timestamp_ms));
                true
            }
            None => false,
        }
    }

    /// Deliver a frame whose buffer does not match its declared size.
    pub fn push_malformed(&self, timestamp_ms: i64) -> bool {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => {
                sink(RawFrame::new(vec![0; 5], 4, 4, PixelFormat::Rgb8, timestamp_ms));
                true
            }
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

pub fn rgb_frame(timestamp_ms: i64) -> RawFrame {
    RawFrame::new(vec![90; 4 * 4 * 3], 4, 4, PixelFormat::Rgb8, timestamp_ms)
}

pub fn small_ingest() -> FrameIngest {
    FrameIngest::new(8, ResizeFilter::Nearest)
}

pub struct Rig {
    pub binder: LifecycleBinder,
    pub feed: ManualFeed,
    pub factory: Arc<FakeFactory>,
    pub engines: Arc<EngineManager>,
    pub rx: PresentationReceiver,
}

/// A configured pipeline on a manual camera; not yet activated.
pub fn rig(gate: Arc<Gate>, teardown_timeout: Duration) -> Rig {
    let factory = FakeFactory::new(gate);
    let engines = Arc::new(EngineManager::new(factory.clone()));
    engines.configure(DeviceConfig::default()).unwrap();

    let (publisher, rx) = ResultPublisher::new(vision::CONFIDENCE_THRESHOLD);
    let (camera, feed) = ManualCamera::new();
    let binder = LifecycleBinder::new(
        Box::new(camera),
        engines.clone(),
        Arc::new(publisher),
        small_ingest(),
        teardown_timeout,
    );
    Rig {
        binder,
        feed,
        factory,
        engines,
        rx,
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
