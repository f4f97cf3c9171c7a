use std::{fmt, str::FromStr};

use anyhow::Error;
use thiserror::Error;

/// Pixel layout tag attached to every frame a camera provider delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Full-resolution luma plane followed by interleaved V/U at quarter resolution.
    Nv21,
    /// Planar YUV 4:2:0: luma, then U, then V.
    I420,
    Rgb8,
    Bgr8,
    Rgba8,
}

impl PixelFormat {
    /// Number of bytes a `width`×`height` buffer of this format must contain.
    ///
    /// `None` when the size does not fit in `usize`.
    pub fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        let pixels = w.checked_mul(h)?;
        match self {
            PixelFormat::Nv21 | PixelFormat::I420 => {
                let chroma = w.div_ceil(2).checked_mul(h.div_ceil(2))?;
                pixels.checked_add(chroma.checked_mul(2)?)
            }
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => pixels.checked_mul(3),
            PixelFormat::Rgba8 => pixels.checked_mul(4),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Nv21 => "nv21",
            PixelFormat::I420 => "i420",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgba8 => "rgba8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Region of a frame reported by the provider as the visible picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FrameRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole `width`×`height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies entirely inside a `width`×`height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }
}

/// Raw frame captured from a camera provider.
///
/// Ownership moves into the consumer for a single conversion and the buffer is
/// dropped afterwards.
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub crop: FrameRect,
    pub timestamp_ms: i64,
}

impl RawFrame {
    /// Build a frame whose crop rectangle covers the whole picture.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, timestamp_ms: i64) -> Self {
        Self {
            data,
            width,
            height,
            format,
            crop: FrameRect::full(width, height),
            timestamp_ms,
        }
    }

    pub fn with_crop(mut self, crop: FrameRect) -> Self {
        self.crop = crop;
        self
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("crop", &self.crop)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

/// Physical lens a provider captures from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LensPosition {
    Front,
    Back,
}

impl LensPosition {
    pub fn opposite(self) -> Self {
        match self {
            LensPosition::Front => LensPosition::Back,
            LensPosition::Back => LensPosition::Front,
        }
    }
}

impl FromStr for LensPosition {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "front" => Ok(LensPosition::Front),
            "back" | "rear" => Ok(LensPosition::Back),
            other => Err(format!("unknown lens {other:?}, expected front or back")),
        }
    }
}

impl fmt::Display for LensPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensPosition::Front => f.write_str("front"),
            LensPosition::Back => f.write_str("back"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("{lens} camera is not available")]
    Unavailable { lens: LensPosition },
    #[error("camera stream is already running")]
    AlreadyRunning,
    #[error("provider cannot switch lenses")]
    SwitchUnsupported,
    #[error("capture thread panicked")]
    ThreadPanicked,
    #[error(transparent)]
    Other(#[from] Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv_lengths_round_chroma_up() {
        assert_eq!(PixelFormat::Nv21.expected_len(4, 4), Some(16 + 8));
        assert_eq!(PixelFormat::I420.expected_len(3, 3), Some(9 + 2 * 4));
        assert_eq!(PixelFormat::Rgba8.expected_len(2, 3), Some(24));
    }

    #[test]
    fn crop_rect_bounds() {
        assert!(FrameRect::new(2, 2, 6, 6).fits_within(8, 8));
        assert!(!FrameRect::new(4, 0, 6, 6).fits_within(8, 8));
        assert!(!FrameRect::new(u32::MAX, 0, 2, 1).fits_within(8, 8));
        assert!(FrameRect::new(0, 0, 0, 3).is_empty());
    }

    #[test]
    fn lens_names_parse() {
        assert_eq!("Front".parse(), Ok(LensPosition::Front));
        assert_eq!("rear".parse(), Ok(LensPosition::Back));
        assert!("side".parse::<LensPosition>().is_err());
        assert_eq!(LensPosition::Back.opposite().to_string(), "front");
    }
}
