//! Cross-validation of strict-tier candidates.
//!
//! A strict match is only accepted if the query patch also looks like the
//! candidate's stored reference images under a simple template-similarity
//! measure. This catches LBPH matches that are close in histogram space but
//! visually unrelated.

use crate::locator::{DetectionPass, FaceLocator};
use crate::normalize::normalize;
use crate::source::EnrollmentSource;
use crate::types::FacePatch;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Knobs of the acceptance rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationParams {
    /// A comparison counts as similar when its combined score exceeds this.
    pub similarity_threshold: f64,
    /// Minimum fraction of similar comparisons.
    pub min_ratio: f64,
    /// Candidates at or above this confidence are rejected outright.
    pub max_confidence: f64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.55,
            min_ratio: 0.3,
            max_confidence: 95.0,
        }
    }
}

/// The three scores of one query/reference comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    /// Mean-subtracted normalized cross-correlation.
    pub ccoeff: f64,
    /// Normalized cross-correlation.
    pub ccorr: f64,
    /// `1 - mean|a - b| / 255`.
    pub structural: f64,
}

impl Similarity {
    pub fn combined(&self) -> f64 {
        (self.ccoeff + self.ccorr + self.structural) / 3.0
    }
}

/// Compare two same-sized patches.
pub fn compare(query: &FacePatch, reference: &FacePatch) -> Similarity {
    let q = Array1::from_iter(query.pixels().iter().map(|&p| p as f64));
    let r = Array1::from_iter(reference.pixels().iter().map(|&p| p as f64));

    let ccorr = normalized_dot(&q, &r);

    let q0 = &q - q.mean().unwrap_or(0.0);
    let r0 = &r - r.mean().unwrap_or(0.0);
    let ccoeff = normalized_dot(&q0, &r0);

    let mean_abs_diff = (&q - &r).mapv(f64::abs).mean().unwrap_or(0.0);
    let structural = 1.0 - mean_abs_diff / 255.0;

    Similarity {
        ccoeff,
        ccorr,
        structural,
    }
}

/// `a·b / (|a| |b|)`, defined as 0 when either vector is zero.
fn normalized_dot(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let denom = (a.dot(a) * b.dot(b)).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        a.dot(b) / denom
    }
}

/// Running count of comparisons against one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub comparisons: usize,
    pub similar: usize,
}

impl Tally {
    pub fn ratio(&self) -> Option<f64> {
        (self.comparisons > 0).then(|| self.similar as f64 / self.comparisons as f64)
    }
}

/// The acceptance rule. Zero comparisons always fail.
pub fn accepts(tally: &Tally, confidence: f64, params: &ValidationParams) -> bool {
    match tally.ratio() {
        Some(ratio) => ratio >= params.min_ratio && confidence < params.max_confidence,
        None => false,
    }
}

pub struct CrossValidator {
    locator: Arc<dyn FaceLocator>,
    source: Arc<dyn EnrollmentSource>,
    params: ValidationParams,
}

impl CrossValidator {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        source: Arc<dyn EnrollmentSource>,
        params: ValidationParams,
    ) -> Self {
        Self {
            locator,
            source,
            params,
        }
    }

    pub fn params(&self) -> &ValidationParams {
        &self.params
    }

    /// Confirm that `query` resembles the stored references of `identity`.
    pub fn validate(&self, query: &FacePatch, identity: &str, confidence: f64) -> bool {
        let tally = self.tally(query, identity);
        let accepted = accepts(&tally, confidence, &self.params);
        tracing::debug!(
            identity,
            confidence,
            comparisons = tally.comparisons,
            similar = tally.similar,
            accepted,
            "cross-validation"
        );
        accepted
    }

    fn tally(&self, query: &FacePatch, identity: &str) -> Tally {
        let references = match self.source.reference_images(identity) {
            Ok(refs) => refs,
            Err(e) => {
                tracing::warn!(identity, error = %e, "cannot list reference images for validation");
                return Tally::default();
            }
        };

        let mut tally = Tally::default();
        for path in &references {
            for patch in self.reference_patches(path) {
                tally.comparisons += 1;
                if compare(query, &patch).combined() > self.params.similarity_threshold {
                    tally.similar += 1;
                }
            }
        }
        tally
    }

    /// Normalized patches of one reference image under the primary training pass.
    /// Images that cannot be read or searched contribute nothing.
    fn reference_patches(&self, path: &Path) -> Vec<FacePatch> {
        let gray = match image::open(path) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable reference"
                );
                return Vec::new();
            }
        };
        let regions = match self.locator.detect(&gray, &DetectionPass::TRAINING_PRIMARY) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "detection failed on reference"
                );
                return Vec::new();
            }
        };
        regions
            .iter()
            .filter_map(|rect| normalize(&gray, rect).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GalleryDir;
    use crate::testutil::{
        blank_image, noise_patch, stripes_image, stripes_patch, write_png, StubLocator, FRAME,
    };
    use crate::types::PATCH_SIZE;
    use image::{GrayImage, Luma};

    fn patch_of(value: u8) -> FacePatch {
        FacePatch::from_image(GrayImage::from_pixel(PATCH_SIZE, PATCH_SIZE, Luma([value])))
    }

    #[test]
    fn test_identical_patches_score_one() {
        let p = noise_patch(5);
        let s = compare(&p, &p);
        assert!((s.ccoeff - 1.0).abs() < 1e-9);
        assert!((s.ccorr - 1.0).abs() < 1e-9);
        assert_eq!(s.structural, 1.0);
        assert!((s.combined() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_denominators_score_zero() {
        let black = patch_of(0);
        let s = compare(&black, &black);
        assert_eq!(s.ccorr, 0.0);
        assert_eq!(s.ccoeff, 0.0);
        assert_eq!(s.structural, 1.0);

        // Constant but non-zero: correlation defined, mean-subtracted not.
        let gray = patch_of(100);
        let s = compare(&gray, &noise_patch(1));
        assert_eq!(s.ccoeff, 0.0);
        assert!(s.ccorr > 0.0);
    }

    #[test]
    fn test_inverted_patch_is_dissimilar() {
        let a = stripes_patch(true, 4);
        let inverted = FacePatch::from_image(GrayImage::from_fn(PATCH_SIZE, PATCH_SIZE, |x, y| {
            Luma([255 - a.image().get_pixel(x, y)[0]])
        }));
        let s = compare(&a, &inverted);
        assert!((s.ccoeff + 1.0).abs() < 1e-9);
        assert_eq!(s.ccorr, 0.0);
        assert_eq!(s.structural, 0.0);
        assert!(s.combined() < 0.55);
    }

    #[test]
    fn test_acceptance_rule_boundaries() {
        let params = ValidationParams::default();
        let at_ratio = Tally {
            comparisons: 10,
            similar: 3,
        };
        assert!(accepts(&at_ratio, 94.999, &params));
        assert!(!accepts(&at_ratio, 95.0, &params));

        let below_ratio = Tally {
            comparisons: 10_000,
            similar: 2_999,
        };
        assert!(!accepts(&below_ratio, 10.0, &params));
    }

    #[test]
    fn test_zero_comparisons_fail_closed() {
        let params = ValidationParams::default();
        assert!(!accepts(&Tally::default(), 0.0, &params));
        assert_eq!(Tally::default().ratio(), None);
    }

    fn validator_over(gallery: &std::path::Path) -> CrossValidator {
        CrossValidator::new(
            Arc::new(StubLocator::all_passes()),
            Arc::new(GalleryDir::open(gallery).unwrap()),
            ValidationParams::default(),
        )
    }

    #[test]
    fn test_validate_against_matching_references() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("alice");
        write_png(&dir, "1_a.png", &stripes_image(FRAME, true, 4, 60, 180));
        write_png(&dir, "2_b.png", &stripes_image(FRAME, true, 4, 80, 200));

        let query = stripes_patch(true, 4);
        let v = validator_over(tmp.path());
        assert!(v.validate(&query, "alice", 12.0));
        assert!(!v.validate(&query, "alice", 95.0));
    }

    #[test]
    fn test_validate_rejects_mismatching_references() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("alice");
        write_png(&dir, "1_a.png", &stripes_image(FRAME, true, 4, 60, 180));

        // Same stripes shifted by half a period: every pixel inverted.
        let shifted = FacePatch::from_image(GrayImage::from_fn(PATCH_SIZE, PATCH_SIZE, |x, _| {
            Luma([if x % 4 < 2 { 255 } else { 0 }])
        }));
        assert!(!validator_over(tmp.path()).validate(&shifted, "alice", 12.0));
    }

    #[test]
    fn test_validate_fails_closed_without_usable_references() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("bob");
        write_png(&dir, "1_blank.png", &blank_image(FRAME));
        std::fs::write(dir.join("2_junk.jpg"), b"junk").unwrap();

        let v = validator_over(tmp.path());
        let query = stripes_patch(true, 4);
        assert!(!v.validate(&query, "bob", 0.0));
        assert!(!v.validate(&query, "nobody", 0.0));
    }
}
