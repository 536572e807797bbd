//! Published model snapshots.
//!
//! Identification reads whatever snapshot is current; retraining builds a
//! complete new snapshot off to the side and swaps it in with a single
//! pointer store. Readers never see a model paired with the wrong label map.

use crate::model::{LbphModel, RecognitionModel};
use crate::trainer::TrainReport;
use crate::types::LabelMap;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};

/// A model together with the label map it was trained against.
pub struct Snapshot {
    pub model: Box<dyn RecognitionModel>,
    pub labels: LabelMap,
    pub report: TrainReport,
    /// Monotonic publish counter; 0 is the empty startup snapshot.
    pub generation: u64,
    pub trained_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(model: Box<dyn RecognitionModel>, labels: LabelMap, report: TrainReport) -> Self {
        Self {
            model,
            labels,
            report,
            generation: 0,
            trained_at: Utc::now(),
        }
    }

    /// Snapshot with nothing enrolled.
    pub fn empty() -> Self {
        Self::new(
            Box::new(LbphModel::untrained()),
            LabelMap::new(),
            TrainReport::default(),
        )
    }
}

pub struct ModelRegistry {
    current: RwLock<Arc<Snapshot>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
        }
    }

    /// The snapshot in effect right now. Holding the returned `Arc` keeps it
    /// alive across a concurrent publish.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current snapshot, stamping it with the next generation.
    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.generation = guard.generation + 1;
        let snapshot = Arc::new(snapshot);
        *guard = Arc::clone(&snapshot);
        drop(guard);

        tracing::info!(
            generation = snapshot.generation,
            identities = snapshot.labels.len(),
            samples = snapshot.model.sample_count(),
            "model snapshot published"
        );
        snapshot
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
