use image::RgbImage;

/// Side length of the square classifier input.
pub const INPUT_SIZE: u32 = 224;

/// Fixed-size interleaved RGB image ready to be fed to an engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessedImage {
    pixels: RgbImage,
}

impl PreprocessedImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbImage {
        self.pixels
    }

    /// Planar CHW float buffer with every channel mapped through `(p - mean) / std`.
    pub fn normalized_chw(&self, mean: f32, std: f32) -> Vec<f32> {
        let plane = (self.width() * self.height()) as usize;
        let mut out = vec![0.0f32; plane * 3];
        for (idx, pixel) in self.pixels.pixels().enumerate() {
            for channel in 0..3 {
                out[channel * plane + idx] = (f32::from(pixel[channel]) - mean) / std;
            }
        }
        out
    }
}
