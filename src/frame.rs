//! Decoded frames.
//!
//! Every source hands the pipeline an RGB8 `Frame`. Frames are immutable once
//! decoded; workers share the latest one with the debug overlay through an
//! `Arc`, and recognition works on owned crops.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::detect::DetectionBox;

/// Shorter side, in pixels, below which plate crops are upscaled before OCR.
pub const OCR_MIN_SIDE: u32 = 120;

/// Largest factor an OCR crop is ever enlarged by.
const MAX_UPSCALE: f64 = 4.0;

/// Upscaled crops never grow past this many pixels on their longer side.
const MAX_UPSCALED_SIDE: f64 = 2048.0;

/// Fraction of the box size added on every side when cropping a vehicle.
pub const CROP_MARGIN: f64 = 0.1;

/// Extra pixels used when a margin crop collapses to nothing.
const DEGENERATE_PAD: i64 = 5;

pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Wrap a packed RGB24 buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self { image })
    }

    /// Decode a JPEG (or any format enabled in `image`) into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode image")?;
        Ok(Self {
            image: image.into_rgb8(),
        })
    }

    /// Solid-colour frame, used by synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Crop the pixel rectangle `[x0, x1) x [y0, y1)`, clamped to the frame.
    pub fn crop(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> Option<Frame> {
        let (w, h) = (self.width() as i64, self.height() as i64);
        let x0 = x0.clamp(0, w);
        let y0 = y0.clamp(0, h);
        let x1 = x1.clamp(0, w);
        let y1 = y1.clamp(0, h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let view = imageops::crop_imm(
            &self.image,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        );
        Some(Frame {
            image: view.to_image(),
        })
    }

    /// Crop a detection with a `CROP_MARGIN` border on every side.
    ///
    /// When the margin crop is empty (a box lying on the frame edge) the
    /// region is widened by a few pixels before giving up.
    pub fn crop_vehicle(&self, detection: &DetectionBox) -> Option<Frame> {
        let (w, h) = (self.width() as i64, self.height() as i64);
        let margin_x = (detection.w as f64 * CROP_MARGIN) as i64;
        let margin_y = (detection.h as f64 * CROP_MARGIN) as i64;
        let x0 = (detection.x as i64 - margin_x).max(0);
        let y0 = (detection.y as i64 - margin_y).max(0);
        let x1 = (detection.x as i64 + detection.w as i64 + margin_x).min(w);
        let y1 = (detection.y as i64 + detection.h as i64 + margin_y).min(h);
        if x1 <= x0 || y1 <= y0 {
            return self.crop(
                x0 - DEGENERATE_PAD,
                y0 - DEGENERATE_PAD,
                x1 + DEGENERATE_PAD,
                y1 + DEGENERATE_PAD,
            );
        }
        self.crop(x0, y0, x1, y1)
    }

    /// Upscale so the shorter side reaches `min_side`, preserving aspect ratio.
    ///
    /// The factor is capped at `MAX_UPSCALE` and by `MAX_UPSCALED_SIDE` on
    /// the longer side, so sliver crops stay short of `min_side`.
    pub fn upscaled_to_min_side(&self, min_side: u32) -> Frame {
        let (w, h) = (self.width(), self.height());
        let (shorter, longer) = (w.min(h), w.max(h));
        let scale = (min_side as f64 / shorter.max(1) as f64)
            .min(MAX_UPSCALE)
            .min(MAX_UPSCALED_SIDE / longer.max(1) as f64);
        if shorter >= min_side || scale <= 1.0 {
            return Frame {
                image: self.image.clone(),
            };
        }
        let nw = ((w as f64 * scale) as u32).max(1);
        let nh = ((h as f64 * scale) as u32).max(1);
        Frame {
            image: imageops::resize(&self.image, nw, nh, FilterType::Triangle),
        }
    }

    /// Downscale to at most `max_width` pixels wide. `0` disables scaling.
    pub fn fit_width(&self, max_width: u32) -> RgbImage {
        let (w, h) = (self.width(), self.height());
        if max_width == 0 || w <= max_width {
            return self.image.clone();
        }
        let nh = ((h as f64 * (max_width as f64 / w as f64)) as u32).max(1);
        imageops::resize(&self.image, max_width, nh, FilterType::Triangle)
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        encode_jpeg(&self.image, quality)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: i32, y: i32, w: i32, h: i32) -> DetectionBox {
        DetectionBox {
            x,
            y,
            w,
            h,
            confidence: 0.9,
            class_id: 2,
        }
    }

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(2, 2, vec![0u8; 12]).is_ok());
        assert!(Frame::from_rgb(2, 2, vec![0u8; 11]).is_err());
    }

    #[test]
    fn vehicle_crop_adds_ten_percent_margin() {
        let frame = Frame::filled(1920, 1080, [10, 10, 10]);
        let crop = frame.crop_vehicle(&detection(960, 540, 200, 150)).unwrap();
        assert_eq!(crop.width(), 240);
        assert_eq!(crop.height(), 180);
    }

    #[test]
    fn vehicle_crop_clamps_to_frame() {
        let frame = Frame::filled(640, 480, [0, 0, 0]);
        let crop = frame.crop_vehicle(&detection(0, 400, 100, 100)).unwrap();
        assert_eq!(crop.width(), 110);
        assert_eq!(crop.height(), 90);
    }

    #[test]
    fn edge_box_is_widened_instead_of_dropped() {
        let frame = Frame::filled(640, 480, [0, 0, 0]);
        let crop = frame.crop_vehicle(&detection(640, 100, 5, 5)).unwrap();
        assert_eq!(crop.width(), 5);
        assert_eq!(crop.height(), 15);
    }

    #[test]
    fn small_crops_are_upscaled_preserving_aspect() {
        let frame = Frame::filled(200, 60, [0, 0, 0]);
        let up = frame.upscaled_to_min_side(OCR_MIN_SIDE);
        assert_eq!(up.height(), 120);
        assert_eq!(up.width(), 400);

        let big = Frame::filled(300, 200, [0, 0, 0]);
        assert_eq!(big.upscaled_to_min_side(OCR_MIN_SIDE).width(), 300);
    }

    #[test]
    fn sliver_crops_are_not_blown_up() {
        let tiny = Frame::filled(10, 30, [0, 0, 0]);
        let up = tiny.upscaled_to_min_side(OCR_MIN_SIDE);
        assert_eq!((up.width(), up.height()), (40, 120));

        let sliver = Frame::filled(2, 600, [0, 0, 0]);
        let up = sliver.upscaled_to_min_side(OCR_MIN_SIDE);
        assert!(up.height() <= 2048);
        assert!(up.width() <= 8);

        let tall = Frame::filled(60, 4000, [0, 0, 0]);
        assert_eq!(tall.upscaled_to_min_side(OCR_MIN_SIDE).height(), 4000);
    }

    #[test]
    fn fit_width_only_shrinks() {
        let frame = Frame::filled(1920, 1080, [0, 0, 0]);
        let small = frame.fit_width(960);
        assert_eq!(small.dimensions(), (960, 540));
        assert_eq!(frame.fit_width(0).dimensions(), (1920, 1080));
        assert_eq!(frame.fit_width(4000).dimensions(), (1920, 1080));
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() -> Result<()> {
        let frame = Frame::filled(64, 48, [200, 100, 50]);
        let bytes = frame.encode_jpeg(90)?;
        let decoded = Frame::decode(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        Ok(())
    }
}
