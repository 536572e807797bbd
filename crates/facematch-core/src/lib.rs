//! facematch-core: face enrollment and recognition engine.
//!
//! Haar-cascade face location, LBPH recognition and a two-tier acceptance
//! policy with template cross-validation, all on the CPU. [`FaceService`]
//! is the entry point; everything else is exposed for front-ends and tests
//! that need to drive a single stage.

pub mod cascade;
pub mod crop;
pub mod identify;
pub mod locator;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod service;
pub mod source;
pub mod trainer;
pub mod types;
pub mod validator;

#[cfg(test)]
mod testutil;

pub use identify::{IdentifyError, Thresholds};
pub use locator::{CascadeLocator, DetectionPass, FaceLocator};
pub use model::{LbphModel, RecognitionModel};
pub use registry::{ModelRegistry, Snapshot};
pub use service::{EnrollError, FaceService, ServiceSettings, TrainError};
pub use source::{EnrolledIdentity, EnrollmentSource, GalleryDir, SourceError};
pub use trainer::TrainReport;
pub use types::{IdentificationResult, IdentifyResponse, LabelMap, Rect, Tier};
pub use validator::ValidationParams;
