//! Frame data structures for captured page content

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, RgbaImage};

/// Layout of the bytes held by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Raw RGBA pixels of the given size
    Rgba { width: u32, height: u32 },
    /// An encoded image file (PNG, JPEG, ...), decoded on demand
    Encoded,
}

/// A captured frame of the current page
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Frame bytes, laid out as `format` says
    pub data: Vec<u8>,
    pub format: FrameFormat,
}

impl CapturedFrame {
    /// Create a frame from raw RGBA pixels
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            format: FrameFormat::Rgba { width, height },
        }
    }

    /// Wrap encoded image bytes without decoding them
    pub fn encoded(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes,
            format: FrameFormat::Encoded,
        }
    }

    /// Create a frame from a decoded image
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::new(rgba.into_raw(), width, height)
    }

    /// Decode into an RGB image
    ///
    /// Fails when encoded bytes are not a supported image or when a raw
    /// buffer does not match its dimensions.
    pub fn to_rgb(&self) -> Result<RgbImage> {
        match self.format {
            FrameFormat::Encoded => {
                let image = image::load_from_memory(&self.data)
                    .context("Failed to decode captured image")?;
                Ok(image.to_rgb8())
            }
            FrameFormat::Rgba { width, height } => {
                let rgba = RgbaImage::from_raw(width, height, self.data.clone()).with_context(|| {
                    format!(
                        "Frame buffer of {} bytes does not match {}x{} RGBA",
                        self.data.len(),
                        width,
                        height
                    )
                })?;
                Ok(DynamicImage::ImageRgba8(rgba).to_rgb8())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_round_trip_through_rgb() {
        let img = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let frame = CapturedFrame::from_image(&DynamicImage::ImageRgb8(img.clone()));
        assert_eq!(frame.format, FrameFormat::Rgba { width: 3, height: 2 });
        assert_eq!(frame.data.len(), 3 * 2 * 4);
        assert_eq!(frame.to_rgb().unwrap(), img);
    }

    #[test]
    fn test_mismatched_buffer_fails() {
        let frame = CapturedFrame::new(vec![0; 10], 4, 4);
        assert!(frame.to_rgb().is_err());
    }

    #[test]
    fn test_encoded_frame_decodes_lazily() {
        let img = RgbImage::from_pixel(5, 4, Rgb([200, 10, 10]));
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let frame = CapturedFrame::encoded(png);
        assert_eq!(frame.format, FrameFormat::Encoded);
        assert_eq!(frame.to_rgb().unwrap(), img);
    }

    #[test]
    fn test_garbage_bytes_fail_only_on_decode() {
        let frame = CapturedFrame::encoded(b"definitely not an image".to_vec());
        let err = frame.to_rgb().unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to decode"));
    }
}
