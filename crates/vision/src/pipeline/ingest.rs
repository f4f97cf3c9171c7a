//! Frame ingest: turns a provider's raw frame into classifier input.
//!
//! Runs synchronously on the camera's capture thread, so it only does a
//! single pass colour conversion, a crop and one resize.

use image::{
    RgbImage,
    imageops::{self, FilterType},
};
use ml_core::{INPUT_SIZE, PreprocessedImage};
use thiserror::Error;
use video_ingest::{FrameRect, PixelFormat, RawFrame};

/// Largest fixed-point intermediate produced by [`yuv_to_rgb`] (18 bits).
const YUV_FIXED_MAX: i32 = 262_143;

/// Resampling used when scaling the cropped picture to the model input size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResizeFilter {
    Nearest,
    /// Bilinear (triangle kernel) resampling.
    #[default]
    Bilinear,
}

impl ResizeFilter {
    fn filter_type(self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Bilinear => FilterType::Triangle,
        }
    }
}

/// Malformed or unsupported frame. The frame is dropped.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error("{format} frame of {width}x{height} needs {expected} bytes, got {actual}")]
    BufferSize {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("{format} frame of {width}x{height} is too large to address")]
    TooLarge {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    #[error("crop {crop:?} lies outside the {width}x{height} frame")]
    CropOutOfBounds {
        crop: FrameRect,
        width: u32,
        height: u32,
    },
}

#[derive(Clone, Debug)]
pub struct FrameIngest {
    input_size: u32,
    filter: ResizeFilter,
}

impl Default for FrameIngest {
    fn default() -> Self {
        Self::new(INPUT_SIZE, ResizeFilter::default())
    }
}

impl FrameIngest {
    pub fn new(input_size: u32, filter: ResizeFilter) -> Self {
        Self { input_size, filter }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Convert, crop and scale `frame` into a square `input_size` RGB image.
    pub fn preprocess(&self, frame: RawFrame) -> Result<PreprocessedImage, PreprocessError> {
        validate(&frame)?;

        let crop = frame.crop;
        let (width, height) = (frame.width, frame.height);
        let rgb = to_rgb(frame)?;

        let cropped = if crop == FrameRect::full(width, height) {
            rgb
        } else {
            imageops::crop_imm(&rgb, crop.x, crop.y, crop.width, crop.height).to_image()
        };

        let side = self.input_size;
        let scaled = if cropped.dimensions() == (side, side) {
            cropped
        } else {
            imageops::resize(&cropped, side, side, self.filter.filter_type())
        };

        Ok(PreprocessedImage::new(scaled))
    }
}

fn validate(frame: &RawFrame) -> Result<(), PreprocessError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(PreprocessError::EmptyFrame);
    }

    let Some(expected) = frame.format.expected_len(frame.width, frame.height) else {
        return Err(PreprocessError::TooLarge {
            format: frame.format,
            width: frame.width,
            height: frame.height,
        });
    };
    if frame.data.len() != expected {
        return Err(PreprocessError::BufferSize {
            format: frame.format,
            width: frame.width,
            height: frame.height,
            expected,
            actual: frame.data.len(),
        });
    }

    if frame.crop.is_empty() || !frame.crop.fits_within(frame.width, frame.height) {
        return Err(PreprocessError::CropOutOfBounds {
            crop: frame.crop,
            width: frame.width,
            height: frame.height,
        });
    }
    Ok(())
}

fn to_rgb(frame: RawFrame) -> Result<RgbImage, PreprocessError> {
    let RawFrame {
        data,
        width,
        height,
        format,
        ..
    } = frame;
    let actual = data.len();

    let interleaved = match format {
        PixelFormat::Rgb8 => data,
        PixelFormat::Bgr8 => data
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect(),
        PixelFormat::Rgba8 => data
            .chunks_exact(4)
            .flat_map(|rgba| [rgba[0], rgba[1], rgba[2]])
            .collect(),
        PixelFormat::Nv21 | PixelFormat::I420 => yuv420_to_rgb(&data, width, height, format),
    };

    RgbImage::from_raw(width, height, interleaved).ok_or(PreprocessError::BufferSize {
        format,
        width,
        height,
        expected: format.expected_len(width, height).unwrap_or_default(),
        actual,
    })
}

/// Expand a 4:2:0 buffer into interleaved RGB. Chroma is sampled once per 2×2 block.
fn yuv420_to_rgb(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (chroma_w, chroma_h) = (w.div_ceil(2), h.div_ceil(2));
    let (luma, chroma) = data.split_at(w * h);

    let mut out = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let block = (row / 2) * chroma_w + col / 2;
            let (u, v) = match format {
                PixelFormat::Nv21 => (chroma[2 * block + 1], chroma[2 * block]),
                _ => (chroma[block], chroma[chroma_w * chroma_h + block]),
            };
            out.extend_from_slice(&yuv_to_rgb(luma[row * w + col], u, v));
        }
    }
    out
}

/// BT.601 video-range conversion in 10-bit fixed point.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = (i32::from(y) - 16).max(0) * 1192;
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;

    let r = (y + 1634 * v).clamp(0, YUV_FIXED_MAX);
    let g = (y - 833 * v - 400 * u).clamp(0, YUV_FIXED_MAX);
    let b = (y + 2066 * u).clamp(0, YUV_FIXED_MAX);
    [(r >> 10) as u8, (g >> 10) as u8, (b >> 10) as u8]
}
