use facematch_core::{ServiceSettings, Thresholds, ValidationParams};
use std::path::PathBuf;

/// Default OpenCV frontal-face cascade shipped by most distributions.
const DEFAULT_CASCADE: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

impl Bus {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Bus::Session),
            "system" => Some(Bus::System),
            _ => None,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Root of the enrollment gallery (one directory per identity).
    pub gallery_dir: PathBuf,
    /// OpenCV Haar cascade XML used for face location.
    pub cascade_path: PathBuf,
    /// Acceptance thresholds and cross-validation rule.
    pub settings: ServiceSettings,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        let gallery_dir = std::env::var("FACEMATCH_GALLERY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery"));

        let cascade_path = std::env::var("FACEMATCH_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CASCADE));

        let thresholds = Thresholds::default();
        let validation = ValidationParams::default();

        let bus = match std::env::var("FACEMATCH_BUS") {
            Ok(v) => Bus::parse(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "unknown FACEMATCH_BUS; using session bus");
                Bus::Session
            }),
            Err(_) => Bus::Session,
        };

        Self {
            gallery_dir,
            cascade_path,
            settings: ServiceSettings {
                thresholds: Thresholds {
                    strict: env_f64("FACEMATCH_STRICT_THRESHOLD", thresholds.strict),
                    moderate: env_f64("FACEMATCH_MODERATE_THRESHOLD", thresholds.moderate),
                },
                validation: ValidationParams {
                    similarity_threshold: env_f64(
                        "FACEMATCH_VALIDATION_SIMILARITY",
                        validation.similarity_threshold,
                    ),
                    min_ratio: env_f64("FACEMATCH_VALIDATION_MIN_RATIO", validation.min_ratio),
                    max_confidence: env_f64(
                        "FACEMATCH_VALIDATION_MAX_CONFIDENCE",
                        validation.max_confidence,
                    ),
                },
            },
            bus,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
