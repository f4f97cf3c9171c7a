//! Camera provider boundary and front/back lens switching.

use std::sync::Arc;

use tracing::{debug, info};

use crate::types::{CaptureError, LensPosition, RawFrame};

/// Callback invoked on the provider's capture thread for every frame.
///
/// Sinks must return quickly; a slow sink stalls subsequent frames.
pub type FrameSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// A source of live frames that can be started and stopped.
///
/// Implementations must guarantee that once [`CameraProvider::stop`] returns,
/// the sink passed to [`CameraProvider::start`] is never invoked again.
pub trait CameraProvider: Send {
    /// Lens the provider currently captures from.
    fn lens(&self) -> LensPosition;

    fn is_available(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool;

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    /// Move capture to the other lens, returning the newly active one.
    fn switch_lens(&mut self) -> Result<LensPosition, CaptureError> {
        Err(CaptureError::SwitchUnsupported)
    }
}

/// Pairs a front and a back provider and routes the stream to one of them.
pub struct LensSwitcher {
    front: Box<dyn CameraProvider>,
    back: Box<dyn CameraProvider>,
    current: LensPosition,
    sink: Option<FrameSink>,
}

impl LensSwitcher {
    /// Create a switcher that starts on the back lens.
    pub fn new(front: Box<dyn CameraProvider>, back: Box<dyn CameraProvider>) -> Self {
        Self::with_default(front, back, LensPosition::Back)
    }

    pub fn with_default(
        front: Box<dyn CameraProvider>,
        back: Box<dyn CameraProvider>,
        lens: LensPosition,
    ) -> Self {
        Self {
            front,
            back,
            current: lens,
            sink: None,
        }
    }

    /// Switching only makes sense when both lenses can be opened.
    pub fn can_switch(&self) -> bool {
        self.front.is_available() && self.back.is_available()
    }

    fn provider(&self, lens: LensPosition) -> &dyn CameraProvider {
        match lens {
            LensPosition::Front => self.front.as_ref(),
            LensPosition::Back => self.back.as_ref(),
        }
    }

    fn provider_mut(&mut self, lens: LensPosition) -> &mut dyn CameraProvider {
        match lens {
            LensPosition::Front => self.front.as_mut(),
            LensPosition::Back => self.back.as_mut(),
        }
    }

    /// Route capture to `lens`, restarting the stream there if it was running.
    pub fn switch_to(&mut self, lens: LensPosition) -> Result<(), CaptureError> {
        if lens == self.current {
            return Ok(());
        }
        if !self.provider(lens).is_available() {
            return Err(CaptureError::Unavailable { lens });
        }

        let previous = self.current;
        if let Some(sink) = self.sink.clone() {
            self.provider_mut(previous).stop()?;
            self.current = lens;
            if let Err(err) = self.provider_mut(lens).start(sink.clone()) {
                // Put the stream back where it was so the caller is not left without frames.
                self.current = previous;
                self.provider_mut(previous).start(sink)?;
                return Err(err);
            }
        } else {
            self.current = lens;
        }

        info!("Camera switched from {previous} to {lens} lens");
        Ok(())
    }
}

impl CameraProvider for LensSwitcher {
    fn lens(&self) -> LensPosition {
        self.current
    }

    fn is_available(&self) -> bool {
        self.provider(self.current).is_available()
    }

    fn is_running(&self) -> bool {
        self.sink.is_some()
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), CaptureError> {
        if self.sink.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let lens = self.current;
        if !self.provider(lens).is_available() {
            return Err(CaptureError::Unavailable { lens });
        }
        self.provider_mut(lens).start(sink.clone())?;
        self.sink = Some(sink);
        debug!("Camera stream started on {lens} lens");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if self.sink.take().is_none() {
            return Ok(());
        }
        let lens = self.current;
        self.provider_mut(lens).stop()?;
        debug!("Camera stream stopped on {lens} lens");
        Ok(())
    }

    fn switch_lens(&mut self) -> Result<LensPosition, CaptureError> {
        let target = self.current.opposite();
        self.switch_to(target)?;
        Ok(target)
    }
}
