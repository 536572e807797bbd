//! Padded face crops for UI feedback.
//!
//! Crops are taken from the color query frame, expanded around the detected
//! face to include hair and chin, and JPEG-encoded. They never influence the
//! identification decision.

use crate::types::Rect;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Horizontal padding on each side, as a fraction of the face width.
const SIDE_PADDING: f32 = 0.5;
/// Top padding, as a fraction of the face height.
const TOP_PADDING: f32 = 0.5;
/// Bottom padding relative to the top padding (0.75 × face height).
const BOTTOM_PADDING_SCALE: f32 = 1.5;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("crop region lies outside the frame")]
    EmptyRegion,
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Expand `face` by the display padding policy and clamp it to the frame.
pub fn padded_region(face: &Rect, frame_width: u32, frame_height: u32) -> Option<Rect> {
    let pad_x = (face.width as f32 * SIDE_PADDING) as u32;
    let pad_top = (face.height as f32 * TOP_PADDING) as u32;
    let pad_bottom = (pad_top as f32 * BOTTOM_PADDING_SCALE) as u32;

    let x0 = face.x.saturating_sub(pad_x);
    let y0 = face.y.saturating_sub(pad_top);
    let x1 = face.right().saturating_add(pad_x).min(frame_width);
    let y1 = face.bottom().saturating_add(pad_bottom).min(frame_height);

    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
}

/// JPEG-encoded padded face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayCrop {
    region: Rect,
    jpeg: Vec<u8>,
}

impl DisplayCrop {
    /// Cut the padded region around `face` out of `frame` and encode it.
    pub fn from_frame(frame: &RgbImage, face: &Rect) -> Result<Self, CropError> {
        let (w, h) = frame.dimensions();
        let region = padded_region(face, w, h).ok_or(CropError::EmptyRegion)?;

        let view =
            image::imageops::crop_imm(frame, region.x, region.y, region.width, region.height)
                .to_image();
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(view).write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)?;

        Ok(Self { region, jpeg })
    }

    /// Frame region the crop was taken from.
    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.jpeg)
    }
}
