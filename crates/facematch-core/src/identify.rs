//! Query identification.
//!
//! Detects faces in a query frame, scores every face against the current
//! snapshot (plain and contrast-boosted), picks the best one and applies the
//! two-tier acceptance policy.

use crate::crop::DisplayCrop;
use crate::locator::{DetectionPass, FaceLocator, LocatorError};
use crate::normalize::{contrast_boost, normalize};
use crate::registry::Snapshot;
use crate::types::{FacePatch, IdentificationResult, Prediction, Rect, Tier};
use crate::validator::{CrossValidator, ValidationParams};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Confidence cut-offs. Lower confidence is a closer match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Below this a match is strict, subject to cross-validation.
    pub strict: f64,
    /// Below this (and not strict) a match is accepted as moderate.
    pub moderate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            strict: 80.0,
            moderate: 100.0,
        }
    }
}

/// Which acceptance path a confidence falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Strict candidate; needs cross-validation.
    Strict,
    Moderate,
    Reject,
}

impl Thresholds {
    /// Anything at or above `moderate` is rejected, even when `strict` was
    /// configured higher than `moderate`.
    pub fn band(&self, confidence: f64) -> Band {
        if confidence >= self.moderate {
            Band::Reject
        } else if confidence < self.strict {
            Band::Strict
        } else {
            Band::Moderate
        }
    }
}

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("no image provided")]
    MissingImage,
    #[error("could not decode image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("face detection failed: {0}")]
    Detection(#[from] LocatorError),
}

impl IdentifyError {
    /// Errors caused by the caller's input rather than the pipeline.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            IdentifyError::MissingImage | IdentifyError::InvalidImage(_)
        )
    }
}

/// Best-scoring face of a query.
struct Candidate {
    region: usize,
    prediction: Prediction,
    patch: FacePatch,
}

pub struct IdentificationEngine {
    locator: Arc<dyn FaceLocator>,
    validator: CrossValidator,
    thresholds: Thresholds,
}

impl IdentificationEngine {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        validator: CrossValidator,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            locator,
            validator,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn validation(&self) -> &ValidationParams {
        self.validator.params()
    }

    /// Identify the face in an encoded image (JPEG, PNG, ...).
    pub fn identify(
        &self,
        snapshot: &Snapshot,
        image_bytes: &[u8],
    ) -> Result<IdentificationResult, IdentifyError> {
        if image_bytes.is_empty() {
            return Err(IdentifyError::MissingImage);
        }
        let frame = image::load_from_memory(image_bytes)?.to_rgb8();
        self.identify_frame(snapshot, &frame)
    }

    /// Identify the face in an already decoded color frame.
    pub fn identify_frame(
        &self,
        snapshot: &Snapshot,
        frame: &RgbImage,
    ) -> Result<IdentificationResult, IdentifyError> {
        let gray = imageops::grayscale(frame);
        let faces = self.locator.detect(&gray, &DetectionPass::INFERENCE)?;

        let Some(first) = faces.first() else {
            tracing::debug!("no face in query image");
            return Ok(IdentificationResult::NoFaceDetected);
        };

        if snapshot.labels.is_empty() {
            return Ok(IdentificationResult::NoEnrollmentData {
                face_crop: display_crop(frame, first),
            });
        }

        let mut best: Option<Candidate> = None;
        for (region, rect) in faces.iter().enumerate() {
            let patch = match normalize(&gray, rect) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(?rect, error = %e, "skipping query region");
                    continue;
                }
            };
            let Some(prediction) = best_variant(snapshot, &patch) else {
                continue;
            };
            if best
                .as_ref()
                .map_or(true, |b| prediction.confidence < b.prediction.confidence)
            {
                best = Some(Candidate {
                    region,
                    prediction,
                    patch,
                });
            }
        }

        let unrecognized = || IdentificationResult::Unrecognized {
            face_crop: display_crop(frame, first),
        };

        let Some(best) = best else {
            return Ok(unrecognized());
        };
        let Prediction { label, confidence } = best.prediction;
        let Some(identity) = snapshot.labels.name(label) else {
            tracing::warn!(label, "model predicted a label missing from the label map");
            return Ok(unrecognized());
        };

        let tier = match self.thresholds.band(confidence) {
            Band::Strict => {
                if self.validator.validate(&best.patch, identity, confidence) {
                    Tier::Strict
                } else {
                    tracing::info!(
                        identity,
                        confidence,
                        "strict candidate failed cross-validation"
                    );
                    return Ok(unrecognized());
                }
            }
            Band::Moderate => Tier::Moderate,
            Band::Reject => {
                tracing::debug!(identity, confidence, "best match above moderate threshold");
                return Ok(unrecognized());
            }
        };

        tracing::info!(identity, confidence, tier = tier.as_str(), "face identified");
        Ok(IdentificationResult::Recognized {
            identity: identity.to_string(),
            confidence,
            tier,
            face_crop: display_crop(frame, &faces[best.region]),
        })
    }
}

/// Lower-confidence prediction of the plain and contrast-boosted patch.
fn best_variant(snapshot: &Snapshot, patch: &FacePatch) -> Option<Prediction> {
    let plain = snapshot.model.predict(patch);
    let boosted = snapshot.model.predict(&contrast_boost(patch));
    match (plain, boosted) {
        (Some(p), Some(b)) if b.confidence < p.confidence => Some(b),
        (Some(p), _) => Some(p),
        (None, b) => b,
    }
}

/// Crops are UI feedback only; failing to build one never fails identification.
fn display_crop(frame: &RgbImage, face: &Rect) -> Option<DisplayCrop> {
    match DisplayCrop::from_frame(frame, face) {
        Ok(crop) => Some(crop),
        Err(e) => {
            tracing::warn!(?face, error = %e, "could not build display crop");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GalleryDir;
    use crate::testutil::{
        blank_image, png_bytes, stripes_image, write_png, BrokenLocator, FixedModel, RegionsLocator,
        ScriptedModel, StubLocator, FRAME,
    };
    use crate::trainer::TrainReport;
    use crate::types::LabelMap;
    use std::path::Path;

    fn engine(gallery: &Path) -> IdentificationEngine {
        let locator: Arc<dyn FaceLocator> = Arc::new(StubLocator::all_passes());
        let validator = CrossValidator::new(
            Arc::clone(&locator),
            Arc::new(GalleryDir::open(gallery).unwrap()),
            ValidationParams::default(),
        );
        IdentificationEngine::new(locator, validator, Thresholds::default())
    }

    fn fixed(name: &str, confidence: f64) -> Snapshot {
        let mut labels = LabelMap::new();
        let label = labels.commit(name);
        Snapshot::new(
            Box::new(FixedModel(Prediction { label, confidence })),
            labels,
            TrainReport::default(),
        )
    }

    fn query() -> Vec<u8> {
        png_bytes(&stripes_image(FRAME, true, 4, 60, 180))
    }

    #[test]
    fn test_band_boundaries() {
        let t = Thresholds::default();
        assert_eq!(t.band(0.0), Band::Strict);
        assert_eq!(t.band(79.99), Band::Strict);
        assert_eq!(t.band(80.0), Band::Moderate);
        assert_eq!(t.band(99.99), Band::Moderate);
        assert_eq!(t.band(100.0), Band::Reject);
    }

    #[test]
    fn test_tier_monotonicity() {
        // Raising a moderate match's confidence never makes it strict; lowering never rejects it.
        let t = Thresholds::default();
        let mut prev = Band::Strict;
        for c in (0..2000).map(|i| i as f64 * 0.1) {
            let band = t.band(c);
            let rank = |b: Band| match b {
                Band::Strict => 0,
                Band::Moderate => 1,
                Band::Reject => 2,
            };
            assert!(rank(band) >= rank(prev), "band went backwards at {c}");
            prev = band;
        }
    }

    #[test]
    fn test_lowering_strict_never_promotes() {
        // Sweeping STRICT downwards can only move a confidence out of the strict band.
        let rank = |b: Band| match b {
            Band::Strict => 0,
            Band::Moderate => 1,
            Band::Reject => 2,
        };
        for c in (0..1200).map(|i| i as f64 * 0.1) {
            let mut prev = Band::Strict;
            for s in (0..=1000).rev().map(|i| i as f64 * 0.1) {
                let band = Thresholds {
                    strict: s,
                    moderate: 100.0,
                }
                .band(c);
                assert!(rank(band) >= rank(prev), "strict={s} confidence={c}");
                if c >= 100.0 {
                    assert_eq!(band, Band::Reject);
                }
                prev = band;
            }
        }
    }

    #[test]
    fn test_inverted_thresholds_still_reject_above_moderate() {
        let t = Thresholds {
            strict: 80.0,
            moderate: 70.0,
        };
        assert_eq!(t.band(60.0), Band::Strict);
        assert_eq!(t.band(70.0), Band::Reject);
        assert_eq!(t.band(75.0), Band::Reject);
    }

    #[test]
    fn test_inverted_thresholds_do_not_accept_above_moderate() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(
            &tmp.path().join("carol"),
            "1_ref.png",
            &stripes_image(FRAME, true, 4, 50, 170),
        );
        let locator: Arc<dyn FaceLocator> = Arc::new(StubLocator::all_passes());
        let validator = CrossValidator::new(
            Arc::clone(&locator),
            Arc::new(GalleryDir::open(tmp.path()).unwrap()),
            ValidationParams::default(),
        );
        let thresholds = Thresholds {
            strict: 80.0,
            moderate: 70.0,
        };
        let engine = IdentificationEngine::new(locator, validator, thresholds);
        let result = engine.identify(&fixed("carol", 75.0), &query()).unwrap();
        assert!(matches!(result, IdentificationResult::Unrecognized { .. }));
    }

    /// 460x240 frame: vertical stripes on the left, horizontal stripes on the right.
    fn two_face_frame() -> (image::GrayImage, Rect, Rect) {
        let frame = image::GrayImage::from_fn(460, FRAME, |x, y| {
            let pos = if x < 230 { x } else { y };
            image::Luma([if pos % 4 < 2 { 60 } else { 180 }])
        });
        (frame, Rect::new(20, 20, 200, 200), Rect::new(240, 20, 200, 200))
    }

    /// Engine whose query locator reports `regions` and whose validator sees the
    /// single stub face of each gallery image.
    fn multi_face_engine(gallery: &Path, regions: Vec<Rect>) -> IdentificationEngine {
        let validator = CrossValidator::new(
            Arc::new(StubLocator::all_passes()),
            Arc::new(GalleryDir::open(gallery).unwrap()),
            ValidationParams::default(),
        );
        IdentificationEngine::new(
            Arc::new(RegionsLocator(regions)),
            validator,
            Thresholds::default(),
        )
    }

    fn scripted(entries: Vec<(&str, FacePatch, f64)>) -> Snapshot {
        let mut labels = LabelMap::new();
        let script = entries
            .into_iter()
            .map(|(name, patch, confidence)| {
                let label = labels.commit(name);
                (patch, Prediction { label, confidence })
            })
            .collect();
        Snapshot::new(
            Box::new(ScriptedModel(script)),
            labels,
            TrainReport::default(),
        )
    }

    fn crop_region(result: &IdentificationResult) -> Rect {
        result.face_crop().expect("crop").region()
    }

    #[test]
    fn test_lowest_confidence_region_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let (frame, left, right) = two_face_frame();
        let snapshot = scripted(vec![
            ("alice", normalize(&frame, &left).unwrap(), 90.0),
            ("bob", normalize(&frame, &right).unwrap(), 85.0),
        ]);
        let engine = multi_face_engine(tmp.path(), vec![left, right]);

        let result = engine.identify(&snapshot, &png_bytes(&frame)).unwrap();
        match &result {
            IdentificationResult::Recognized {
                identity,
                confidence,
                tier,
                ..
            } => {
                assert_eq!(identity, "bob");
                assert_eq!(*confidence, 85.0);
                assert_eq!(*tier, Tier::Moderate);
            }
            other => panic!("expected bob, got {other:?}"),
        }
        let rgb = image::DynamicImage::ImageLuma8(frame).to_rgb8();
        let expected = DisplayCrop::from_frame(&rgb, &right).unwrap().region();
        assert_eq!(crop_region(&result), expected);
    }

    #[test]
    fn test_equal_confidence_keeps_first_region() {
        let tmp = tempfile::tempdir().unwrap();
        let (frame, left, right) = two_face_frame();
        let snapshot = scripted(vec![
            ("alice", normalize(&frame, &left).unwrap(), 85.0),
            ("bob", normalize(&frame, &right).unwrap(), 85.0),
        ]);

        let engine = multi_face_engine(tmp.path(), vec![right, left]);
        let result = engine.identify(&snapshot, &png_bytes(&frame)).unwrap();
        assert!(matches!(
            &result,
            IdentificationResult::Recognized { identity, .. } if identity == "bob"
        ));

        let engine = multi_face_engine(tmp.path(), vec![left, right]);
        let result = engine.identify(&snapshot, &png_bytes(&frame)).unwrap();
        assert!(matches!(
            &result,
            IdentificationResult::Recognized { identity, .. } if identity == "alice"
        ));
    }

    #[test]
    fn test_validation_uses_winning_region_patch() {
        // Bob's only reference matches the right-hand face; the left-hand face,
        // processed last, would fail validation against it.
        let tmp = tempfile::tempdir().unwrap();
        write_png(
            &tmp.path().join("bob"),
            "1_ref.png",
            &stripes_image(FRAME, false, 4, 60, 180),
        );
        let (frame, left, right) = two_face_frame();
        let snapshot = scripted(vec![
            ("alice", normalize(&frame, &left).unwrap(), 50.0),
            ("bob", normalize(&frame, &right).unwrap(), 30.0),
        ]);
        let engine = multi_face_engine(tmp.path(), vec![right, left]);

        let result = engine.identify(&snapshot, &png_bytes(&frame)).unwrap();
        match &result {
            IdentificationResult::Recognized { identity, tier, .. } => {
                assert_eq!(identity, "bob");
                assert_eq!(*tier, Tier::Strict);
            }
            other => panic!("expected validated strict match, got {other:?}"),
        }
        let rgb = image::DynamicImage::ImageLuma8(frame).to_rgb8();
        let expected = DisplayCrop::from_frame(&rgb, &right).unwrap().region();
        assert_eq!(crop_region(&result), expected);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = engine(tmp.path()).identify(&Snapshot::empty(), &[]).unwrap_err();
        assert!(matches!(err, IdentifyError::MissingImage));
        assert!(err.is_input_error());
    }

    #[test]
    fn test_undecodable_input_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = engine(tmp.path())
            .identify(&Snapshot::empty(), b"definitely not a png")
            .unwrap_err();
        assert!(matches!(err, IdentifyError::InvalidImage(_)));
        assert!(err.is_input_error());
    }

    #[test]
    fn test_detector_failure_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let locator: Arc<dyn FaceLocator> = Arc::new(BrokenLocator);
        let validator = CrossValidator::new(
            Arc::clone(&locator),
            Arc::new(GalleryDir::open(tmp.path()).unwrap()),
            ValidationParams::default(),
        );
        let engine = IdentificationEngine::new(locator, validator, Thresholds::default());
        let err = engine.identify(&fixed("a", 1.0), &query()).unwrap_err();
        assert!(matches!(err, IdentifyError::Detection(_)));
        assert!(!err.is_input_error());
    }

    #[test]
    fn test_no_face() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = png_bytes(&blank_image(FRAME));
        let result = engine(tmp.path()).identify(&fixed("a", 1.0), &bytes).unwrap();
        assert!(matches!(result, IdentificationResult::NoFaceDetected));
        assert!(result.face_crop().is_none());
    }

    #[test]
    fn test_no_enrollment_data_carries_crop() {
        let tmp = tempfile::tempdir().unwrap();
        let result = engine(tmp.path()).identify(&Snapshot::empty(), &query()).unwrap();
        assert!(matches!(result, IdentificationResult::NoEnrollmentData { .. }));
        assert!(result.face_crop().is_some());
    }

    #[test]
    fn test_moderate_band_skips_validation() {
        // The gallery is empty, so validation would fail if it ran.
        let tmp = tempfile::tempdir().unwrap();
        let result = engine(tmp.path()).identify(&fixed("carol", 90.0), &query()).unwrap();
        match result {
            IdentificationResult::Recognized {
                identity,
                tier,
                confidence,
                face_crop,
            } => {
                assert_eq!(identity, "carol");
                assert_eq!(tier, Tier::Moderate);
                assert_eq!(confidence, 90.0);
                assert!(face_crop.is_some());
            }
            other => panic!("expected moderate match, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_strict_validation_is_not_demoted() {
        let tmp = tempfile::tempdir().unwrap();
        let result = engine(tmp.path()).identify(&fixed("carol", 50.0), &query()).unwrap();
        assert!(
            matches!(result, IdentificationResult::Unrecognized { .. }),
            "a strict candidate that fails validation must not fall back to moderate"
        );
        assert!(result.face_crop().is_some());
    }

    #[test]
    fn test_validated_strict_match() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(
            &tmp.path().join("carol"),
            "1_ref.png",
            &stripes_image(FRAME, true, 4, 50, 170),
        );
        let result = engine(tmp.path()).identify(&fixed("carol", 50.0), &query()).unwrap();
        assert!(matches!(
            result,
            IdentificationResult::Recognized {
                tier: Tier::Strict,
                ..
            }
        ));
        assert_eq!(
            result.message(),
            "Identified: carol [Confidence: 50.00]"
        );
    }

    #[test]
    fn test_above_moderate_is_unrecognized() {
        let tmp = tempfile::tempdir().unwrap();
        let result = engine(tmp.path()).identify(&fixed("carol", 100.0), &query()).unwrap();
        assert!(matches!(result, IdentificationResult::Unrecognized { .. }));
    }
}
