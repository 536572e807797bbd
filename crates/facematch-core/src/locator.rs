//! Face location.
//!
//! [`FaceLocator`] is the seam the pipeline detects faces through. The
//! production implementation, [`CascadeLocator`], runs a Viola-Jones Haar
//! cascade over an image pyramid and groups overlapping hits.

use crate::cascade::{CascadeError, HaarCascade, IntegralImage};
use crate::types::Rect;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

/// Relative tolerance used when clustering overlapping candidates.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("scale factor must be greater than 1, got {0}")]
    InvalidScaleFactor(f64),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Parameters of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionPass {
    /// Pyramid step between window sizes.
    pub scale_factor: f64,
    /// Candidates a cluster needs beyond this count to be reported.
    pub min_neighbors: u32,
    /// Smallest face (width, height) to report.
    pub min_size: (u32, u32),
}

impl DetectionPass {
    /// First pass over enrollment images.
    pub const TRAINING_PRIMARY: Self = Self {
        scale_factor: 1.1,
        min_neighbors: 3,
        min_size: (30, 30),
    };

    /// Relaxed pass over enrollment images where the primary pass found nothing.
    pub const TRAINING_FALLBACK: Self = Self {
        scale_factor: 1.2,
        min_neighbors: 2,
        min_size: (20, 20),
    };

    /// Strict single pass over query images.
    pub const INFERENCE: Self = Self {
        scale_factor: 1.05,
        min_neighbors: 8,
        min_size: (50, 50),
    };
}

/// Finds face regions in a grayscale image.
///
/// Regions come back in detector order. Callers must not assume the first
/// region is the largest or most confident.
pub trait FaceLocator: Send + Sync {
    fn detect(&self, image: &GrayImage, pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError>;
}

/// Haar cascade face locator.
pub struct CascadeLocator {
    cascade: HaarCascade,
}

impl CascadeLocator {
    pub fn new(cascade: HaarCascade) -> Self {
        Self { cascade }
    }

    /// Load an OpenCV cascade XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        HaarCascade::load(path).map(Self::new)
    }

    /// Slide the cascade window over every pyramid level and collect raw hits
    /// in original image coordinates.
    fn scan(&self, image: &GrayImage, pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError> {
        if !(pass.scale_factor > 1.0) {
            return Err(LocatorError::InvalidScaleFactor(pass.scale_factor));
        }

        let (img_w, img_h) = image.dimensions();
        let (base_w, base_h) = self.cascade.window_size();
        let (min_w, min_h) = pass.min_size;

        let mut candidates = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let win_w = (base_w as f64 * factor).round() as u32;
            let win_h = (base_h as f64 * factor).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            let level_w = (img_w as f64 / factor).round() as u32;
            let level_h = (img_h as f64 / factor).round() as u32;
            if level_w < base_w || level_h < base_h {
                break;
            }

            if win_w >= min_w && win_h >= min_h {
                let level: Cow<GrayImage> = if level_w == img_w && level_h == img_h {
                    Cow::Borrowed(image)
                } else {
                    Cow::Owned(imageops::resize(image, level_w, level_h, FilterType::Triangle))
                };
                let ii = IntegralImage::new(&level);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..=level_h - base_h).step_by(step) {
                    for x in (0..=level_w - base_w).step_by(step) {
                        if !self.cascade.classify(&ii, x, y) {
                            continue;
                        }
                        let hit = Rect::new(
                            (x as f64 * factor).round() as u32,
                            (y as f64 * factor).round() as u32,
                            win_w,
                            win_h,
                        );
                        if let Some(hit) = hit.clamp_to(img_w, img_h) {
                            candidates.push(hit);
                        }
                    }
                }
            }

            factor *= pass.scale_factor;
        }

        Ok(candidates)
    }
}

impl FaceLocator for CascadeLocator {
    fn detect(&self, image: &GrayImage, pass: &DetectionPass) -> Result<Vec<Rect>, LocatorError> {
        let candidates = self.scan(image, pass)?;
        let raw = candidates.len();
        let faces = group_rectangles(candidates, pass.min_neighbors, GROUP_EPS);
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            raw,
            faces = faces.len(),
            "cascade scan complete"
        );
        Ok(faces)
    }
}

/// Whether two candidates belong to the same cluster.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.right(), b.right())
        && close(a.bottom(), b.bottom())
}

/// Cluster labels for `rects`, numbered in order of each cluster's first member.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Merge raw cascade hits into face regions.
///
/// Clusters of similar candidates are averaged; clusters with
/// `min_neighbors` or fewer members are dropped, as are clusters nested
/// inside a better-supported one. `min_neighbors == 0` disables grouping.
pub(crate) fn group_rectangles(rects: Vec<Rect>, min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, classes) = partition(&rects, eps);
    let mut sums = vec![[0u64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (r, &class) in rects.iter().zip(&labels) {
        let s = &mut sums[class];
        s[0] += r.x as u64;
        s[1] += r.y as u64;
        s[2] += r.width as u64;
        s[3] += r.height as u64;
        counts[class] += 1;
    }

    let clusters: Vec<(Rect, u32)> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            (Rect::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3])), n)
        })
        .collect();

    let mut faces = Vec::new();
    for (i, &(r1, n1)) in clusters.iter().enumerate() {
        if n1 <= min_neighbors {
            continue;
        }
        let nested = clusters.iter().enumerate().any(|(j, &(r2, n2))| {
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            r1.x as i64 >= r2.x as i64 - dx
                && r1.y as i64 >= r2.y as i64 - dy
                && r1.right() as i64 <= r2.right() as i64 + dx
                && r1.bottom() as i64 <= r2.bottom() as i64 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            faces.push(r1);
        }
    }
    faces
}
