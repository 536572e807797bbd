//! Enrollment data source.
//!
//! The core never owns reference images; it reads them through
//! [`EnrollmentSource`]. [`GalleryDir`] is the filesystem implementation:
//! one sub-directory per identity under a gallery root.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted as reference images (lower case).
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("gallery I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("a new identity needs at least one reference image: {0}")]
    NoImages(String),
    #[error("unsupported reference image {0} (expected .jpg, .jpeg or .png)")]
    UnsupportedImage(String),
}

impl SourceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SourceError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// An identity and its reference images, in stable order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrolledIdentity {
    pub name: String,
    pub references: Vec<PathBuf>,
}

/// Where enrolled identities and their reference images come from.
pub trait EnrollmentSource: Send + Sync {
    /// Every identity, in a stable enumeration order.
    fn identities(&self) -> Result<Vec<EnrolledIdentity>, SourceError>;

    /// Current reference images of one identity.
    fn reference_images(&self, name: &str) -> Result<Vec<PathBuf>, SourceError>;

    /// Store new reference images for `name`, creating the identity if needed.
    /// Existing references are kept. Returns the stored paths.
    fn add_references(&self, name: &str, images: &[PathBuf]) -> Result<Vec<PathBuf>, SourceError>;
}

/// Filesystem gallery: `<root>/<identity>/<n>_<file>.{jpg,jpeg,png}`.
pub struct GalleryDir {
    root: PathBuf,
}

impl GalleryDir {
    /// Open (and create if missing) a gallery rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SourceError::io(&root, e))?;
        Ok(Self { root })
    }

    fn identity_dir(&self, name: &str) -> Result<PathBuf, SourceError> {
        if !is_valid_name(name) {
            return Err(SourceError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl EnrollmentSource for GalleryDir {
    fn identities(&self) -> Result<Vec<EnrolledIdentity>, SourceError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| SourceError::io(&self.root, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceError::io(&self.root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && is_valid_name(&name) && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let references = self.reference_images(&name)?;
                Ok(EnrolledIdentity { name, references })
            })
            .collect()
    }

    fn reference_images(&self, name: &str) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.identity_dir(name)?;
        if !dir.is_dir() {
            return Err(SourceError::UnknownIdentity(name.to_string()));
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| SourceError::io(&dir, e))?;

        let mut images = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SourceError::io(&dir, e))?.path();
            if path.is_file() && has_image_extension(&path) {
                images.push(path);
            }
        }
        images.sort();
        Ok(images)
    }

    fn add_references(&self, name: &str, images: &[PathBuf]) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.identity_dir(name)?;
        let existing = if dir.is_dir() {
            self.reference_images(name)?
        } else {
            if images.is_empty() {
                return Err(SourceError::NoImages(name.to_string()));
            }
            Vec::new()
        };
        // Numbering continues after the highest prefix so a gap never reuses a name.
        let next = existing
            .iter()
            .filter_map(|p| numeric_prefix(p))
            .max()
            .map_or(1, |n| n + 1);

        for src in images {
            if !has_image_extension(src) {
                return Err(SourceError::UnsupportedImage(src.display().to_string()));
            }
        }

        std::fs::create_dir_all(&dir).map_err(|e| SourceError::io(&dir, e))?;

        let mut stored = Vec::with_capacity(images.len());
        for (i, src) in images.iter().enumerate() {
            let file_name = src
                .file_name()
                .ok_or_else(|| SourceError::UnsupportedImage(src.display().to_string()))?
                .to_string_lossy();
            let dest = dir.join(format!("{}_{}", next + i, file_name));
            if dest.exists() {
                return Err(SourceError::io(
                    &dest,
                    std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                ));
            }
            std::fs::copy(src, &dest).map_err(|e| SourceError::io(src, e))?;
            tracing::debug!(
                identity = name,
                src = %src.display(),
                dest = %dest.display(),
                "stored reference image"
            );
            stored.push(dest);
        }

        tracing::info!(
            identity = name,
            added = stored.len(),
            existing = existing.len(),
            "reference images added"
        );
        Ok(stored)
    }
}

/// `7` for `7_front.jpg`.
fn numeric_prefix(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let (n, _) = name.split_once('_')?;
    n.parse().ok()
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Identity names double as directory names.
fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
