use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::action::coords::ImageDims;
use crate::errors::{PilotError, PilotResult};

/// Samples per axis for blank detection.
const BLANK_GRID: u32 = 10;
/// A channel below this is "black".
const BLACK_CHANNEL_MAX: u8 = 10;

/// One captured screen.
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    image: DynamicImage,
}

/// A frame ready to be attached to a user message.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// `data:image/jpeg;base64,…`
    pub data_url: String,
    /// Dimensions of the image actually sent.
    pub dims: ImageDims,
    /// Dimensions before scaling.
    pub original_dims: ImageDims,
    /// Encoded JPEG size.
    pub bytes: usize,
}

impl PreparedImage {
    pub fn was_scaled(&self) -> bool {
        self.dims != self.original_dims
    }
}

impl ScreenFrame {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    /// Decode PNG/JPEG bytes as returned by a capture backend.
    pub fn decode(bytes: &[u8]) -> PilotResult<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| PilotError::Image(format!("screenshot decode: {e}")))?;
        Ok(Self { image })
    }

    pub fn dims(&self) -> ImageDims {
        let (w, h) = self.image.dimensions();
        ImageDims::new(w, h)
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Fraction of a coarse sample grid whose pixels are black.
    pub fn black_ratio(&self) -> f64 {
        let (w, h) = self.image.dimensions();
        if w == 0 || h == 0 {
            return 1.0;
        }
        let step_x = (w / BLANK_GRID).max(1) as usize;
        let step_y = (h / BLANK_GRID).max(1) as usize;

        let mut black = 0usize;
        let mut total = 0usize;
        for y in (0..h).step_by(step_y) {
            for x in (0..w).step_by(step_x) {
                let [r, g, b, _] = self.image.get_pixel(x, y).0;
                if r < BLACK_CHANNEL_MAX && g < BLACK_CHANNEL_MAX && b < BLACK_CHANNEL_MAX {
                    black += 1;
                }
                total += 1;
            }
        }
        black as f64 / total as f64
    }

    /// Uniformly black frame, as produced when the foreground app blocks capture.
    pub fn is_blank(&self, threshold: f64) -> bool {
        self.black_ratio() >= threshold
    }

    /// Scale (factors below 1.0 shrink), re-encode as JPEG and wrap in a data URL.
    pub fn prepare(&self, scale_factor: f64, jpeg_quality: u8) -> PilotResult<PreparedImage> {
        let original_dims = self.dims();
        let scaled;
        let source = if scale_factor > 0.0 && scale_factor < 1.0 {
            let w = ((original_dims.width as f64 * scale_factor) as u32).max(1);
            let h = ((original_dims.height as f64 * scale_factor) as u32).max(1);
            scaled = self.image.resize_exact(w, h, FilterType::Triangle);
            &scaled
        } else {
            &self.image
        };

        let mut jpeg = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality.clamp(1, 100));
        DynamicImage::ImageRgb8(source.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(|e| PilotError::Image(format!("JPEG encode: {e}")))?;

        let b64 = base64::engine::general_purpose::STANDARD.encode(&jpeg);
        let (w, h) = source.dimensions();
        Ok(PreparedImage {
            data_url: format!("data:image/jpeg;base64,{b64}"),
            dims: ImageDims::new(w, h),
            original_dims,
            bytes: jpeg.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn solid(w: u32, h: u32, color: [u8; 3]) -> ScreenFrame {
        ScreenFrame::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(color))))
    }

    #[test]
    fn black_frame_is_blank() {
        assert!(solid(108, 240, [0, 0, 0]).is_blank(0.98));
        assert!(solid(108, 240, [9, 9, 9]).is_blank(0.98));
    }

    #[test]
    fn content_frame_is_not_blank() {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        for y in 0..100 {
            for x in 0..20 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let frame = ScreenFrame::new(DynamicImage::ImageRgb8(img));
        assert!((frame.black_ratio() - 0.8).abs() < 1e-9);
        assert!(!frame.is_blank(0.98));
    }

    #[test]
    fn prepare_reports_scaled_dimensions() {
        let prepared = solid(200, 400, [30, 60, 90]).prepare(0.5, 80).unwrap();
        assert_eq!(prepared.dims, ImageDims::new(100, 200));
        assert_eq!(prepared.original_dims, ImageDims::new(200, 400));
        assert!(prepared.was_scaled());
        assert!(prepared.data_url.starts_with("data:image/jpeg;base64,"));
        assert!(prepared.bytes > 0);
    }

    #[test]
    fn prepare_without_scaling_keeps_dimensions() {
        let prepared = solid(64, 32, [200, 0, 0]).prepare(1.0, 90).unwrap();
        assert_eq!(prepared.dims, ImageDims::new(64, 32));
        assert!(!prepared.was_scaled());
    }

    #[test]
    fn decode_round_trips_png() {
        let mut png = Vec::new();
        solid(12, 34, [1, 2, 3])
            .image()
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(ScreenFrame::decode(&png).unwrap().dims(), ImageDims::new(12, 34));
        assert!(ScreenFrame::decode(b"not an image").is_err());
    }
}
