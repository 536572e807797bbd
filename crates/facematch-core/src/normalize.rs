//! Face patch normalization.
//!
//! Every patch handed to the recognition model, at training time and at
//! query time, goes through [`normalize`]: crop, histogram equalization,
//! resize to 200×200, min-max intensity stretch. The model is sensitive to
//! preprocessing drift, so this is the only way to build a [`FacePatch`].

use crate::types::{FacePatch, Rect, PATCH_SIZE};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use thiserror::Error;

/// Patches whose Laplacian variance is at or below this are too blurry to train on.
pub const SHARPNESS_THRESHOLD: f64 = 10.0;

const CONTRAST_ALPHA: f32 = 1.2;
const CONTRAST_BETA: f32 = 10.0;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("face region {rect:?} lies outside the {width}x{height} image")]
    OutsideImage { rect: Rect, width: u32, height: u32 },
}

/// Crop `rect` out of `image` and turn it into a canonical face patch.
pub fn normalize(image: &GrayImage, rect: &Rect) -> Result<FacePatch, NormalizeError> {
    let (width, height) = image.dimensions();
    let region = rect
        .clamp_to(width, height)
        .ok_or(NormalizeError::OutsideImage {
            rect: *rect,
            width,
            height,
        })?;

    let mut face =
        imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
    equalize_hist(&mut face);

    let mut patch = imageops::resize(&face, PATCH_SIZE, PATCH_SIZE, FilterType::Triangle);
    stretch_min_max(&mut patch);

    Ok(FacePatch::from_image(patch))
}

/// Global histogram equalization in place.
///
/// The lowest occupied intensity maps to 0 and the cumulative distribution
/// of the rest is spread over 1..=255. A single-valued image is left as is.
pub fn equalize_hist(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return;
    };
    if hist[first] == total {
        return;
    }

    let scale = 255.0f32 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0usize;
    for i in (first + 1)..256 {
        cumulative += hist[i];
        lut[i] = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Linearly rescale intensities so the darkest pixel is 0 and the brightest 255.
///
/// A constant image has no range to stretch and becomes all zeros.
pub fn stretch_min_max(gray: &mut GrayImage) {
    let Some((min, max)) = gray
        .as_raw()
        .iter()
        .fold(None, |acc: Option<(u8, u8)>, &p| match acc {
            None => Some((p, p)),
            Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
        })
    else {
        return;
    };

    if min == max {
        gray.iter_mut().for_each(|p| *p = 0);
        return;
    }

    // Integer arithmetic so halves round up exactly.
    let range = (max - min) as u32;
    for p in gray.iter_mut() {
        *p = (((*p - min) as u32 * 255 + range / 2) / range) as u8;
    }
}

/// Variance of the 4-neighbour Laplacian, with reflect-101 borders.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let raw = gray.as_raw();
    let at = |x: isize, y: isize| -> f64 {
        raw[reflect101(y, h) * w + reflect101(x, w)] as f64
    };

    let lap = Array2::from_shape_fn((h, w), |(y, x)| {
        let (x, y) = (x as isize, y as isize);
        at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y)
    });

    lap.var(0.0)
}

/// Blur metric of a patch; higher is sharper.
pub fn sharpness(patch: &FacePatch) -> f64 {
    laplacian_variance(patch.image())
}

/// Whether a primary-pass training patch is sharp enough to keep.
pub fn passes_sharpness_gate(patch: &FacePatch) -> bool {
    sharpness(patch) > SHARPNESS_THRESHOLD
}

/// Contrast-boosted copy of a patch: `saturate(|p * 1.2 + 10|)`.
pub fn contrast_boost(patch: &FacePatch) -> FacePatch {
    let mut boosted = patch.image().clone();
    for p in boosted.iter_mut() {
        *p = (*p as f32 * CONTRAST_ALPHA + CONTRAST_BETA)
            .abs()
            .round()
            .min(255.0) as u8;
    }
    FacePatch::from_image(boosted)
}

fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i.clamp(0, n - 1) as usize
}
