//! LBPH (local binary pattern histogram) recognition model.
//!
//! Each training patch is reduced to a spatial histogram of circular LBP
//! codes; prediction is a nearest-neighbour search under the chi-square
//! distance. The distance is reported as the confidence, so lower means a
//! closer match and the value has no fixed upper bound.

use crate::types::{FacePatch, Label, Prediction};
use ndarray::{Array1, Array2, ArrayView1, Axis};

const LBP_RADIUS: usize = 1;
const LBP_NEIGHBORS: usize = 8;
const GRID_X: usize = 8;
const GRID_Y: usize = 8;
const LBP_BINS: usize = 1 << LBP_NEIGHBORS;
const HISTOGRAM_LEN: usize = GRID_X * GRID_Y * LBP_BINS;

/// A trained (or empty) face classifier.
pub trait RecognitionModel: Send + Sync {
    /// Closest enrolled label for `patch`, or `None` when nothing was trained.
    fn predict(&self, patch: &FacePatch) -> Option<Prediction>;

    /// Number of training patches the model holds.
    fn sample_count(&self) -> usize;

    fn is_trained(&self) -> bool {
        self.sample_count() > 0
    }
}

/// LBPH model. Immutable once built; retraining builds a new one.
pub struct LbphModel {
    /// One spatial histogram per training patch, row-aligned with `labels`.
    histograms: Array2<f32>,
    labels: Vec<Label>,
}

impl LbphModel {
    /// A model with no training data. Predicts nothing.
    pub fn untrained() -> Self {
        Self {
            histograms: Array2::zeros((0, HISTOGRAM_LEN)),
            labels: Vec::new(),
        }
    }

    /// Train on the full labeled set in one batch.
    pub fn train<'a>(samples: impl IntoIterator<Item = (&'a FacePatch, Label)>) -> Self {
        let (histograms, labels): (Vec<Array1<f32>>, Vec<Label>) = samples
            .into_iter()
            .map(|(patch, label)| (histogram(patch), label))
            .unzip();

        let mut matrix = Array2::zeros((histograms.len(), HISTOGRAM_LEN));
        for (mut row, hist) in matrix.axis_iter_mut(Axis(0)).zip(&histograms) {
            row.assign(hist);
        }

        tracing::debug!(samples = labels.len(), "LBPH model trained");
        Self {
            histograms: matrix,
            labels,
        }
    }
}

impl RecognitionModel for LbphModel {
    fn predict(&self, patch: &FacePatch) -> Option<Prediction> {
        let query = histogram(patch);
        let mut best: Option<Prediction> = None;

        for (row, &label) in self.histograms.axis_iter(Axis(0)).zip(&self.labels) {
            let dist = chi_square(row, query.view());
            // Strict comparison: the earliest sample wins ties.
            if best.map_or(true, |b| dist < b.confidence) {
                best = Some(Prediction {
                    label,
                    confidence: dist,
                });
            }
        }
        best
    }

    fn sample_count(&self) -> usize {
        self.labels.len()
    }
}

/// Circular LBP codes for every interior pixel of the patch.
fn lbp_codes(patch: &FacePatch) -> Array2<u8> {
    let image = patch.image();
    let (w, h) = (image.width() as usize, image.height() as usize);
    let r = LBP_RADIUS;
    let src = |y: usize, x: usize| image.as_raw()[y * w + x] as f32;

    let mut codes = Array2::<u8>::zeros((h - 2 * r, w - 2 * r));

    for n in 0..LBP_NEIGHBORS {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / LBP_NEIGHBORS as f64;
        let sx = (r as f64 * angle.cos()) as f32;
        let sy = (-(r as f64) * angle.sin()) as f32;

        let (fx, fy) = (sx.floor() as isize, sy.floor() as isize);
        let (cx, cy) = (sx.ceil() as isize, sy.ceil() as isize);
        let (tx, ty) = (sx - sx.floor(), sy - sy.floor());
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let at = |dy: isize, dx: isize| {
                    src((i as isize + dy) as usize, (j as isize + dx) as usize)
                };
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = src(i, j);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[[i - r, j - r]] |= 1 << n;
                }
            }
        }
    }
    codes
}

/// Concatenated per-cell LBP histograms, each cell normalized to sum to 1.
fn histogram(patch: &FacePatch) -> Array1<f32> {
    let codes = lbp_codes(patch);
    let (rows, cols) = codes.dim();
    let cell_h = rows / GRID_Y;
    let cell_w = cols / GRID_X;
    let cell_pixels = (cell_h * cell_w) as f32;

    let mut hist = Array1::<f32>::zeros(HISTOGRAM_LEN);
    for gy in 0..GRID_Y {
        for gx in 0..GRID_X {
            let offset = (gy * GRID_X + gx) * LBP_BINS;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    hist[offset + codes[[y, x]] as usize] += 1.0;
                }
            }
        }
    }
    hist /= cell_pixels;
    hist
}

/// Symmetric chi-square distance `Σ 2(a − b)² / (a + b)`.
fn chi_square(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&a, &b)| {
            let sum = (a + b) as f64;
            if sum > 0.0 {
                let diff = (a - b) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}
