//! Shared fixtures for unit tests.

use crate::locator::{DetectionPass, FaceLocator, LocatorError};
use crate::model::RecognitionModel;
use crate::types::{FacePatch, Prediction, Rect, PATCH_SIZE};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Square gray frame side used by end-to-end fixtures.
pub(crate) const FRAME: u32 = 240;

/// Face region the stub locator reports inside a [`FRAME`]-sized image.
pub(crate) const FACE: Rect = Rect {
    x: 20,
    y: 20,
    width: 200,
    height: 200,
};

/// Stripes of `period` pixels (half dark, half bright), `lo` and `hi` levels.
pub(crate) fn stripes_image(size: u32, vertical: bool, period: u32, lo: u8, hi: u8) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        let pos = if vertical { x } else { y };
        if pos % period < period / 2 {
            Luma([lo])
        } else {
            Luma([hi])
        }
    })
}

pub(crate) fn stripes_patch(vertical: bool, period: u32) -> FacePatch {
    FacePatch::from_image(stripes_image(PATCH_SIZE, vertical, period, 0, 255))
}

pub(crate) fn noise_patch(seed: u64) -> FacePatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let img = GrayImage::from_fn(PATCH_SIZE, PATCH_SIZE, |_, _| Luma([rng.gen::<u8>()]));
    FacePatch::from_image(img)
}

pub(crate) fn blank_image(size: u32) -> GrayImage {
    GrayImage::from_pixel(size, size, Luma([128]))
}

/// Write `img` as an RGB PNG at `dir/file`, creating `dir`.
pub(crate) fn write_png(dir: &Path, file: &str, img: &GrayImage) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(file);
    DynamicImage::ImageLuma8(img.clone())
        .to_rgb8()
        .save(&path)
        .unwrap();
    path
}

/// Encoded RGB PNG bytes, as a client would upload them.
pub(crate) fn png_bytes(img: &GrayImage) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(img.clone()).to_rgb8())
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Locator that reports [`FACE`] in any non-uniform image, for the listed passes only.
pub(crate) struct StubLocator {
    passes: Vec<DetectionPass>,
}

impl StubLocator {
    pub(crate) fn all_passes() -> Self {
        Self::only(&[
            DetectionPass::TRAINING_PRIMARY,
            DetectionPass::TRAINING_FALLBACK,
            DetectionPass::INFERENCE,
        ])
    }

    pub(crate) fn only(passes: &[DetectionPass]) -> Self {
        Self {
            passes: passes.to_vec(),
        }
    }
}

impl FaceLocator for StubLocator {
    fn detect(&self, image: &GrayImage, pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError> {
        if !self.passes.contains(pass) {
            return Ok(Vec::new());
        }
        let first = image.as_raw().first().copied();
        if image.as_raw().iter().all(|&p| Some(p) == first) {
            return Ok(Vec::new());
        }
        Ok(FACE
            .clamp_to(image.width(), image.height())
            .into_iter()
            .collect())
    }
}

/// Locator that always fails.
pub(crate) struct BrokenLocator;

impl FaceLocator for BrokenLocator {
    fn detect(&self, _image: &GrayImage, _pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError> {
        Err(LocatorError::Failed("detector crashed".into()))
    }
}

/// Model that returns the same prediction for every patch.
pub(crate) struct FixedModel(pub(crate) Prediction);

impl RecognitionModel for FixedModel {
    fn predict(&self, _patch: &FacePatch) -> Option<Prediction> {
        Some(self.0)
    }

    fn sample_count(&self) -> usize {
        1
    }
}

/// Locator that reports the same regions, in order, for any non-uniform image.
pub(crate) struct RegionsLocator(pub(crate) Vec<Rect>);

impl FaceLocator for RegionsLocator {
    fn detect(&self, image: &GrayImage, _pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError> {
        let first = image.as_raw().first().copied();
        if image.as_raw().iter().all(|&p| Some(p) == first) {
            return Ok(Vec::new());
        }
        Ok(self.0.clone())
    }
}

/// Model that knows a fixed set of patches and predicts nothing for any other.
pub(crate) struct ScriptedModel(pub(crate) Vec<(FacePatch, Prediction)>);

impl RecognitionModel for ScriptedModel {
    fn predict(&self, patch: &FacePatch) -> Option<Prediction> {
        self.0
            .iter()
            .find(|(known, _)| known == patch)
            .map(|(_, prediction)| *prediction)
    }

    fn sample_count(&self) -> usize {
        self.0.len()
    }
}
