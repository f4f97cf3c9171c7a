//! OpenCV-backed camera provider.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use chrono::Utc;
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, error, warn};

use crate::{
    provider::{CameraProvider, FrameSink},
    types::{CaptureError, LensPosition, PixelFormat, RawFrame},
};

struct Running {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Captures BGR frames from a V4L device index or a video URI.
pub struct OpenCvCamera {
    uri: String,
    lens: LensPosition,
    size: (u32, u32),
    fps: f64,
    running: Option<Running>,
}

impl OpenCvCamera {
    pub fn new(uri: impl Into<String>, lens: LensPosition, size: (u32, u32), fps: f64) -> Self {
        Self {
            uri: uri.into(),
            lens,
            size,
            fps,
            running: None,
        }
    }
}

impl CameraProvider for OpenCvCamera {
    fn lens(&self) -> LensPosition {
        self.lens
    }

    fn is_available(&self) -> bool {
        match parse_device_index(&self.uri) {
            Some(index) => std::path::Path::new(&format!("/dev/video{index}")).exists(),
            None => true,
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if self.running.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        // Open on the caller's thread so a bad URI fails `start` instead of the capture thread.
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.size, self.fps);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let uri = self.uri.clone();
        let handle = thread::Builder::new()
            .name(format!("opencv-camera-{}", self.lens))
            .spawn(move || {
                if let Err(err) = capture_loop(cap, &thread_stop, &sink) {
                    error!("Capture from {uri} failed: {err}");
                }
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        self.running = Some(Running { stop, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(Running { stop, handle }) = self.running.take() else {
            return Ok(());
        };
        stop.store(true, Ordering::SeqCst);
        handle.join().map_err(|_| CaptureError::ThreadPanicked)
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Read frames until asked to stop, forwarding each to `sink` as BGR8.
fn capture_loop(
    mut cap: VideoCapture,
    stop: &AtomicBool,
    sink: &FrameSink,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut delivered: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            continue;
        }

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            continue;
        }

        let data = frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        let timestamp_ms = Utc::now().timestamp_millis();

        sink(RawFrame::new(
            data,
            size.width as u32,
            size.height as u32,
            PixelFormat::Bgr8,
            timestamp_ms,
        ));
        delivered = delivered.wrapping_add(1);
    }

    debug!("OpenCV capture stopped after {delivered} frame(s)");
    Ok(())
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply capture resolution and frame rate hints. Drivers are free to ignore them.
fn configure_camera(cap: &mut VideoCapture, size: (u32, u32), fps: f64) {
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(size.0));
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(size.1));
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
