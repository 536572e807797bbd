//! Enrollment training.
//!
//! Turns every reference image of every identity into normalized face
//! patches and builds a fresh [`LbphModel`] plus [`LabelMap`] from them.
//! Per-image failures are recorded in the [`TrainReport`] and never abort
//! the run.

use crate::locator::{DetectionPass, FaceLocator};
use crate::model::LbphModel;
use crate::normalize::{normalize, passes_sharpness_gate, sharpness};
use crate::source::EnrolledIdentity;
use crate::types::{FacePatch, Label, LabelMap};
use image::GrayImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Why a reference image contributed nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The file could not be read or decoded.
    Unreadable(String),
    /// The locator returned an error.
    DetectorFailed(String),
    /// Neither detection pass found a face.
    NoFace,
    /// Faces were found but every one failed the sharpness gate or normalization.
    NoUsableRegion,
}

/// What happened to one reference image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImageOutcome {
    Used {
        /// Patches from the primary pass that passed the sharpness gate.
        primary: usize,
        /// Patches from the fallback pass (not gated).
        fallback: usize,
        /// Primary-pass regions dropped as too blurry.
        blurry: usize,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: ImageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityReport {
    pub name: String,
    /// Assigned label; `None` when no usable patch was produced.
    pub label: Option<Label>,
    pub patches: usize,
    pub images: Vec<ImageReport>,
}

/// Summary of one training run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainReport {
    pub identities: Vec<IdentityReport>,
}

impl TrainReport {
    pub fn total_patches(&self) -> usize {
        self.identities.iter().map(|i| i.patches).sum()
    }

    /// Identities that got no label because none of their images was usable.
    pub fn unrecognizable(&self) -> impl Iterator<Item = &str> {
        self.identities
            .iter()
            .filter(|i| i.label.is_none())
            .map(|i| i.name.as_str())
    }
}

/// Result of a training run, ready to publish.
pub struct TrainOutput {
    pub model: LbphModel,
    pub labels: LabelMap,
    pub report: TrainReport,
}

pub struct Trainer {
    locator: Arc<dyn FaceLocator>,
}

impl Trainer {
    pub fn new(locator: Arc<dyn FaceLocator>) -> Self {
        Self { locator }
    }

    /// Build a model from scratch over every identity, in enumeration order.
    ///
    /// Labels are dense and follow enumeration order among identities that
    /// produced at least one patch.
    pub fn train(&self, identities: &[EnrolledIdentity]) -> TrainOutput {
        let mut labels = LabelMap::new();
        let mut samples: Vec<(FacePatch, Label)> = Vec::new();
        let mut report = TrainReport::default();

        for identity in identities {
            let mut patches = Vec::new();
            let mut images = Vec::with_capacity(identity.references.len());

            for path in &identity.references {
                let (mut found, outcome) = self.extract(path);
                tracing::debug!(
                    identity = %identity.name,
                    path = %path.display(),
                    ?outcome,
                    "reference image processed"
                );
                patches.append(&mut found);
                images.push(ImageReport {
                    path: path.clone(),
                    outcome,
                });
            }

            let label = if patches.is_empty() {
                tracing::warn!(
                    identity = %identity.name,
                    images = identity.references.len(),
                    "no usable face in any reference image; identity will not be recognizable"
                );
                None
            } else {
                let label = labels.commit(identity.name.clone());
                Some(label)
            };

            let count = patches.len();
            if let Some(label) = label {
                samples.extend(patches.into_iter().map(|p| (p, label)));
            }
            report.identities.push(IdentityReport {
                name: identity.name.clone(),
                label,
                patches: count,
                images,
            });
        }

        let model = LbphModel::train(samples.iter().map(|(p, l)| (p, *l)));

        tracing::info!(
            identities = identities.len(),
            labels = labels.len(),
            patches = samples.len(),
            "training complete"
        );

        TrainOutput {
            model,
            labels,
            report,
        }
    }

    /// Patches from one reference image.
    fn extract(&self, path: &Path) -> (Vec<FacePatch>, ImageOutcome) {
        let gray = match image::open(path) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable reference image"
                );
                return (Vec::new(), ImageOutcome::Skipped(SkipReason::Unreadable(e.to_string())));
            }
        };

        match self.extract_from(&gray) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "face detection failed on reference image"
                );
                (Vec::new(), ImageOutcome::Skipped(SkipReason::DetectorFailed(e.to_string())))
            }
        }
    }

    /// Primary pass with the sharpness gate; the fallback pass runs only when
    /// the primary pass finds nothing, and its patches are not gated.
    fn extract_from(
        &self,
        gray: &GrayImage,
    ) -> Result<(Vec<FacePatch>, ImageOutcome), crate::locator::LocatorError> {
        let mut patches = Vec::new();
        let (mut primary, mut fallback, mut blurry) = (0, 0, 0);

        let regions = self.locator.detect(gray, &DetectionPass::TRAINING_PRIMARY)?;
        if !regions.is_empty() {
            for rect in &regions {
                let patch = match normalize(gray, rect) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping face region");
                        continue;
                    }
                };
                if passes_sharpness_gate(&patch) {
                    patches.push(patch);
                    primary += 1;
                } else {
                    tracing::debug!(?rect, sharpness = sharpness(&patch), "face region too blurry");
                    blurry += 1;
                }
            }
        } else {
            let regions = self.locator.detect(gray, &DetectionPass::TRAINING_FALLBACK)?;
            if regions.is_empty() {
                return Ok((Vec::new(), ImageOutcome::Skipped(SkipReason::NoFace)));
            }
            for rect in &regions {
                match normalize(gray, rect) {
                    Ok(p) => {
                        patches.push(p);
                        fallback += 1;
                    }
                    Err(e) => tracing::debug!(error = %e, "dropping fallback face region"),
                }
            }
        }

        let outcome = if patches.is_empty() {
            ImageOutcome::Skipped(SkipReason::NoUsableRegion)
        } else {
            ImageOutcome::Used {
                primary,
                fallback,
                blurry,
            }
        };
        Ok((patches, outcome))
    }
}
