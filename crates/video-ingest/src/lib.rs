//! Camera-side boundary of the live classifier.
//!
//! Providers deliver [`RawFrame`]s on their own capture thread through a
//! [`FrameSink`] and can be started, stopped and (for [`LensSwitcher`])
//! moved between the front and back lens.

mod provider;
mod synthetic;
mod types;

#[cfg(feature = "opencv")]
mod camera;

#[cfg(feature = "opencv")]
pub use camera::OpenCvCamera;
pub use provider::{CameraProvider, FrameSink, LensSwitcher};
pub use synthetic::{SyntheticCamera, test_pattern};
pub use types::{CaptureError, FrameRect, LensPosition, PixelFormat, RawFrame};
