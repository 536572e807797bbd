use facematch_core::{
    CascadeLocator, EnrollError, FaceService, IdentifyResponse, ServiceSettings, Snapshot,
    SourceError, TrainError, TrainReport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cascade error: {0}")]
    Cascade(#[from] facematch_core::cascade::CascadeError),
    #[error("gallery error: {0}")]
    Source(#[from] SourceError),
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Summary of a published snapshot, returned by Enroll and Retrain.
#[derive(Debug, Serialize)]
pub struct PublishSummary {
    pub generation: u64,
    pub trained_at: String,
    pub identities: Vec<String>,
    pub samples: usize,
    pub unrecognizable: Vec<String>,
    pub report: TrainReport,
}

impl PublishSummary {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            generation: snapshot.generation,
            trained_at: snapshot.trained_at.to_rfc3339(),
            identities: snapshot.labels.iter().map(|(_, n)| n.to_string()).collect(),
            samples: snapshot.model.sample_count(),
            unrecognizable: snapshot
                .report
                .unrecognizable()
                .map(str::to_string)
                .collect(),
            report: snapshot.report.clone(),
        }
    }
}

/// One row of ListIdentities.
#[derive(Debug, Serialize)]
pub struct IdentityEntry {
    pub name: String,
    /// `None` until a retrain produced a usable patch for this identity.
    pub label: Option<u32>,
    pub references: usize,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        images: Vec<PathBuf>,
        reply: oneshot::Sender<Result<PublishSummary, EngineError>>,
    },
    Retrain {
        reply: oneshot::Sender<Result<PublishSummary, EngineError>>,
    },
}

/// Clone-safe handle to the engine.
///
/// Enrollment and retraining go through the single engine thread, so they
/// never overlap. Identification reads the current snapshot on the blocking
/// pool and never waits for a retrain.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    service: Arc<FaceService>,
}

impl EngineHandle {
    /// Store reference images for `name` and retrain.
    pub async fn enroll(
        &self,
        name: String,
        images: Vec<PathBuf>,
    ) -> Result<PublishSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                name,
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rebuild the model from the gallery as it is now.
    pub async fn retrain(&self) -> Result<PublishSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Retrain { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Identify a query image. Never fails: errors become an error response.
    pub async fn identify(&self, image: Vec<u8>) -> IdentifyResponse {
        let service = Arc::clone(&self.service);
        match tokio::task::spawn_blocking(move || service.identify_response(&image)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "identification task aborted");
                IdentifyResponse::internal_error(e)
            }
        }
    }

    /// Every identity in the gallery with its current label, if any.
    pub async fn identities(&self) -> Result<Vec<IdentityEntry>, EngineError> {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || list_identities(&service)).await?
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.service.snapshot()
    }

    pub fn settings(&self) -> ServiceSettings {
        self.service.settings()
    }
}

fn list_identities(service: &FaceService) -> Result<Vec<IdentityEntry>, EngineError> {
    let snapshot = service.snapshot();
    let entries = service
        .source()
        .identities()?
        .into_iter()
        .map(|identity| IdentityEntry {
            label: snapshot.labels.label_of(&identity.name),
            references: identity.references.len(),
            name: identity.name,
        })
        .collect();
    Ok(entries)
}

/// Build the service and spawn the engine on a dedicated OS thread.
///
/// Loads the cascade and runs the initial training synchronously so the
/// daemon fails fast when the gallery or cascade is unusable.
pub fn spawn_engine(
    gallery_dir: PathBuf,
    cascade_path: PathBuf,
    settings: ServiceSettings,
) -> Result<EngineHandle, EngineError> {
    let locator = CascadeLocator::load(&cascade_path)?;
    let gallery = facematch_core::GalleryDir::open(&gallery_dir)?;
    tracing::info!(path = %gallery_dir.display(), "gallery opened");

    let service = Arc::new(FaceService::new(
        Arc::new(gallery),
        Arc::new(locator),
        settings,
    ));
    spawn_with_service(service)
}

/// Spawn the engine thread around an existing service and run the initial training.
pub fn spawn_with_service(service: Arc<FaceService>) -> Result<EngineHandle, EngineError> {
    let initial = service.retrain()?;
    tracing::info!(
        identities = initial.labels.len(),
        samples = initial.model.sample_count(),
        "initial model trained"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let worker = Arc::clone(&service);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        name,
                        images,
                        reply,
                    } => {
                        let result = worker
                            .enroll(&name, &images)
                            .map(|s| PublishSummary::from_snapshot(&s))
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Retrain { reply } => {
                        let result = worker
                            .retrain()
                            .map(|s| PublishSummary::from_snapshot(&s))
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, service })
}
