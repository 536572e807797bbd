use crate::engine::{EngineError, EngineHandle};
use std::path::PathBuf;
use zbus::interface;

/// D-Bus interface for the facematch daemon.
///
/// Bus name: org.facematch.Facematch1
/// Object path: /org/facematch/Facematch1
pub struct FacematchService {
    engine: EngineHandle,
    gallery_dir: PathBuf,
    cascade_path: PathBuf,
}

impl FacematchService {
    pub fn new(engine: EngineHandle, gallery_dir: PathBuf, cascade_path: PathBuf) -> Self {
        Self {
            engine,
            gallery_dir,
            cascade_path,
        }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Enroll(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facematch.Facematch1")]
impl FacematchService {
    /// Identify the face in an encoded image. Always answers with a JSON
    /// response; input and internal errors are reported inside it.
    async fn identify(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "identify requested");
        let response = self.engine.identify(image).await;
        to_json(&response)
    }

    /// Add reference images to an identity (creating it if new) and retrain.
    async fn enroll(&self, name: &str, paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(name, images = paths.len(), "enroll requested");
        let images = paths.into_iter().map(PathBuf::from).collect();
        let summary = self
            .engine
            .enroll(name.to_string(), images)
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Rebuild the model from the gallery.
    async fn retrain(&self) -> zbus::fdo::Result<String> {
        tracing::info!("retrain requested");
        let summary = self.engine.retrain().await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// List gallery identities with their current labels.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let entries = self.engine.identities().await.map_err(to_fdo)?;
        to_json(&entries)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.engine.snapshot();
        let settings = self.engine.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gallery_dir": self.gallery_dir.display().to_string(),
            "cascade_path": self.cascade_path.display().to_string(),
            "generation": snapshot.generation,
            "trained_at": snapshot.trained_at.to_rfc3339(),
            "identities": snapshot.labels.len(),
            "samples": snapshot.model.sample_count(),
            "thresholds": settings.thresholds,
            "validation": settings.validation,
        })
        .to_string())
    }
}
