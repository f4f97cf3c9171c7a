//! Deterministic test-pattern camera used for demos and pipeline tests.

use std::{thread, time::Duration};

use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::debug;

use crate::{
    provider::{CameraProvider, FrameSink},
    types::{CaptureError, LensPosition, PixelFormat, RawFrame},
};

struct Running {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Camera provider that emits a moving gradient at a fixed rate.
pub struct SyntheticCamera {
    lens: LensPosition,
    width: u32,
    height: u32,
    format: PixelFormat,
    interval: Duration,
    running: Option<Running>,
}

impl SyntheticCamera {
    pub fn new(lens: LensPosition, width: u32, height: u32, format: PixelFormat, fps: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        Self {
            lens,
            width,
            height,
            format,
            interval,
            running: None,
        }
    }
}

impl CameraProvider for SyntheticCamera {
    fn lens(&self) -> LensPosition {
        self.lens
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if self.running.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (width, height, format, interval) = (self.width, self.height, self.format, self.interval);
        let handle = thread::Builder::new()
            .name(format!("synthetic-camera-{}", self.lens))
            .spawn(move || {
                let mut phase: u32 = 0;
                loop {
                    let data = test_pattern(width, height, format, phase);
                    let timestamp_ms = Utc::now().timestamp_millis();
                    sink(RawFrame::new(data, width, height, format, timestamp_ms));
                    phase = phase.wrapping_add(1);

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("synthetic camera emitted {phase} frame(s)");
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(Running { stop_tx, handle }) = self.running.take() else {
            return Ok(());
        };
        drop(stop_tx);
        handle.join().map_err(|_| CaptureError::ThreadPanicked)
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Render one frame of the synthetic gradient in `format`.
pub fn test_pattern(width: u32, height: u32, format: PixelFormat, phase: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut data = Vec::with_capacity(format.expected_len(width, height).unwrap_or_default());
    match format {
        PixelFormat::Nv21 | PixelFormat::I420 => {
            for y in 0..h {
                for x in 0..w {
                    data.push(16 + ((x + y + phase as usize) % 220) as u8);
                }
            }
            let chroma = 2 * w.div_ceil(2) * h.div_ceil(2);
            data.resize(data.len() + chroma, 128);
        }
        PixelFormat::Rgb8 | PixelFormat::Bgr8 | PixelFormat::Rgba8 => {
            let blue = (phase % 256) as u8;
            for y in 0..h {
                for x in 0..w {
                    let red = (x * 255 / w.max(1)) as u8;
                    let green = (y * 255 / h.max(1)) as u8;
                    match format {
                        PixelFormat::Bgr8 => data.extend_from_slice(&[blue, green, red]),
                        PixelFormat::Rgba8 => data.extend_from_slice(&[red, green, blue, 255]),
                        _ => data.extend_from_slice(&[red, green, blue]),
                    }
                }
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn pattern_matches_declared_layout() {
        for format in [
            PixelFormat::Nv21,
            PixelFormat::I420,
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::Rgba8,
        ] {
            assert_eq!(
                Some(test_pattern(33, 17, format, 5).len()),
                format.expected_len(33, 17),
                "{format}"
            );
        }
    }

    #[test]
    fn no_frames_after_stop_returns() {
        let mut camera = SyntheticCamera::new(LensPosition::Back, 16, 16, PixelFormat::Nv21, 500);
        let frames = Arc::new(AtomicUsize::new(0));
        let counter = frames.clone();
        camera
            .start(Arc::new(move |frame| {
                assert_eq!(frame.width, 16);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(camera.is_running());
        thread::sleep(Duration::from_millis(30));
        camera.stop().unwrap();

        let seen = frames.load(Ordering::SeqCst);
        assert!(seen >= 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(frames.load(Ordering::SeqCst), seen);
        assert!(!camera.is_running());
    }
}
