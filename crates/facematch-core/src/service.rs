//! Face service: the single entry point front-ends talk to.
//!
//! Owns the enrollment source, trainer, identification engine and model
//! registry, and wires them together. Retraining and enrollment are
//! serialized internally; identification only reads the current snapshot
//! and can run on any number of threads.

use crate::identify::{IdentificationEngine, IdentifyError, Thresholds};
use crate::locator::FaceLocator;
use crate::registry::{ModelRegistry, Snapshot};
use crate::source::{EnrollmentSource, SourceError};
use crate::trainer::Trainer;
use crate::types::{IdentificationResult, IdentifyResponse};
use crate::validator::{CrossValidator, ValidationParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Tunable decision policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub thresholds: Thresholds,
    pub validation: ValidationParams,
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("cannot enumerate enrolled identities: {0}")]
    Source(#[from] SourceError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("cannot store reference images: {0}")]
    Source(#[from] SourceError),
    #[error("retraining after enrollment failed: {0}")]
    Train(#[from] TrainError),
}

pub struct FaceService {
    source: Arc<dyn EnrollmentSource>,
    trainer: Trainer,
    engine: IdentificationEngine,
    registry: ModelRegistry,
    /// Single-writer guard: one retrain publishes at a time, in order.
    writer: Mutex<()>,
}

impl FaceService {
    /// Build a service with an empty model. Call [`FaceService::retrain`]
    /// to load the enrolled identities.
    pub fn new(
        source: Arc<dyn EnrollmentSource>,
        locator: Arc<dyn FaceLocator>,
        settings: ServiceSettings,
    ) -> Self {
        let validator = CrossValidator::new(
            Arc::clone(&locator),
            Arc::clone(&source),
            settings.validation,
        );
        Self {
            trainer: Trainer::new(Arc::clone(&locator)),
            engine: IdentificationEngine::new(locator, validator, settings.thresholds),
            source,
            registry: ModelRegistry::new(),
            writer: Mutex::new(()),
        }
    }

    /// Rebuild the model from every current reference image and publish it.
    pub fn retrain(&self) -> Result<Arc<Snapshot>, TrainError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.retrain_locked()
    }

    fn retrain_locked(&self) -> Result<Arc<Snapshot>, TrainError> {
        let identities = self.source.identities()?;
        tracing::info!(identities = identities.len(), "retraining");

        let output = self.trainer.train(&identities);
        Ok(self.registry.publish(Snapshot::new(
            Box::new(output.model),
            output.labels,
            output.report,
        )))
    }

    /// Add reference images for `name` (creating the identity if new), then retrain.
    pub fn enroll(&self, name: &str, images: &[PathBuf]) -> Result<Arc<Snapshot>, EnrollError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = self.source.add_references(name, images)?;
        tracing::info!(identity = name, images = stored.len(), "enrolled");
        Ok(self.retrain_locked()?)
    }

    /// Identify a query against the snapshot current at call time.
    pub fn identify(&self, image_bytes: &[u8]) -> Result<IdentificationResult, IdentifyError> {
        let snapshot = self.registry.current();
        self.engine.identify(&snapshot, image_bytes)
    }

    /// [`FaceService::identify`] folded into a response; errors never escape.
    pub fn identify_response(&self, image_bytes: &[u8]) -> IdentifyResponse {
        match self.identify(image_bytes) {
            Ok(result) => result.to_response(),
            Err(e) if e.is_input_error() => {
                tracing::debug!(error = %e, "query rejected");
                IdentifyResponse::rejected(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "identification failed");
                IdentifyResponse::internal_error(e)
            }
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.current()
    }

    pub fn source(&self) -> &Arc<dyn EnrollmentSource> {
        &self.source
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            thresholds: *self.engine.thresholds(),
            validation: *self.engine.validation(),
        }
    }
}
