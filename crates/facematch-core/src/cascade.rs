//! Boosted Haar cascade definitions.
//!
//! Reads OpenCV-format cascade XML (`haarcascade_frontalface_default.xml`
//! and friends) and evaluates a single detection window against integral
//! images. Multi-scale search and candidate grouping live in
//! [`crate::locator`].

use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Windows whose standard deviation (over the inset normalization rect) is
/// at or below this are rejected before any stage runs.
const MIN_WINDOW_STDDEV: f64 = 10.0;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; point FACEMATCH_CASCADE_PATH at an OpenCV haarcascade XML")]
    NotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade xml: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// One rectangle of a Haar feature with its weight, in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Haar-like feature: weighted sum of rectangle sums.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn response(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Internal split node of a weak classifier tree.
///
/// Child indices `> 0` point at another node, indices `<= 0` at leaf `-idx`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    pub threshold: f32,
}

/// Boosted weak classifier (a stump when it has a single node).
#[derive(Debug, Clone, PartialEq)]
pub struct WeakTree {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

impl WeakTree {
    /// Walk the tree, asking `value_of` for normalized feature responses.
    fn evaluate(&self, mut value_of: impl FnMut(usize) -> f64) -> f32 {
        let mut idx = 0i32;
        loop {
            let node = &self.nodes[idx as usize];
            idx = if value_of(node.feature) < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                return self.leaves[(-idx) as usize];
            }
        }
    }
}

/// A boosting stage: the window survives if the leaf sum reaches the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub trees: Vec<WeakTree>,
}

/// Validated Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Build a cascade, checking every index and rectangle up front so that
    /// window evaluation cannot go out of bounds or loop.
    pub fn new(
        window: (u32, u32),
        stages: Vec<Stage>,
        features: Vec<HaarFeature>,
    ) -> Result<Self, CascadeError> {
        let (ww, wh) = window;
        if ww < 3 || wh < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {ww}x{wh} is smaller than 3x3"
            )));
        }
        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        for (fi, feature) in features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(CascadeError::Invalid(format!("feature {fi} has no rects")));
            }
            for r in &feature.rects {
                if r.x + r.width > ww || r.y + r.height > wh {
                    return Err(CascadeError::Invalid(format!(
                        "feature {fi} rect {r:?} exceeds the {ww}x{wh} window"
                    )));
                }
            }
        }

        for (si, stage) in stages.iter().enumerate() {
            for (ti, tree) in stage.trees.iter().enumerate() {
                validate_tree(tree, features.len())
                    .map_err(|msg| CascadeError::Invalid(format!("stage {si} tree {ti}: {msg}")))?;
            }
        }

        Ok(Self {
            window,
            stages,
            features,
        })
    }

    /// Load an OpenCV cascade XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml(&text)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse the `<cascade>` element of an OpenCV cascade document.
    pub fn from_xml(text: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported("no <cascade> element (legacy pre-2.x format?)".into())
            })?;

        let stage_type = child_text(root, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = child_text(root, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let width: u32 = parse_one(child_text(root, "width")?, "width")?;
        let height: u32 = parse_one(child_text(root, "height")?, "height")?;

        let stages = items(child(root, "stages")?)
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        let features = items(child(root, "features")?)
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new((width, height), stages, features)
    }

    /// Base detection window (width, height).
    pub fn window_size(&self) -> (u32, u32) {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run the whole cascade on the window whose top-left corner is (`x`, `y`).
    pub(crate) fn classify(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        let (ww, wh) = self.window;
        let area = ((ww - 2) * (wh - 2)) as f64;
        let sum = ii.sum(x + 1, y + 1, ww - 2, wh - 2) as f64;
        let sqsum = ii.sqsum(x + 1, y + 1, ww - 2, wh - 2) as f64;

        // area * stddev
        let norm = area * sqsum - sum * sum;
        if norm <= 0.0 {
            return false;
        }
        let norm = norm.sqrt();
        if norm <= MIN_WINDOW_STDDEV * area {
            return false;
        }
        let inv_norm = 1.0 / norm;

        for stage in &self.stages {
            let score: f64 = stage
                .trees
                .iter()
                .map(|tree| {
                    tree.evaluate(|fi| self.features[fi].response(ii, x, y) * inv_norm) as f64
                })
                .sum();
            if score < stage.threshold as f64 {
                return false;
            }
        }
        true
    }
}

fn validate_tree(tree: &WeakTree, feature_count: usize) -> Result<(), String> {
    if tree.nodes.is_empty() {
        return Err("no nodes".into());
    }
    for (i, node) in tree.nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(format!("node {i} references missing feature {}", node.feature));
        }
        for child in [node.left, node.right] {
            if child > 0 {
                // Children must come after their parent, which rules out cycles.
                if (child as usize) <= i || child as usize >= tree.nodes.len() {
                    return Err(format!("node {i} has invalid child {child}"));
                }
            } else if (-child) as usize >= tree.leaves.len() {
                return Err(format!("node {i} references missing leaf {}", -child));
            }
        }
    }
    Ok(())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| CascadeError::Invalid(format!("missing <{name}>")))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, CascadeError> {
    child(node, name)?
        .text()
        .map(str::trim)
        .ok_or_else(|| CascadeError::Invalid(format!("empty <{name}>")))
}

/// Element children (`<_>` list entries in OpenCV storage files).
fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn parse_one<T: FromStr>(token: &str, what: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("bad {what} value {token:?}")))
}

fn parse_stage(node: Node) -> Result<Stage, CascadeError> {
    let threshold = parse_one(child_text(node, "stageThreshold")?, "stageThreshold")?;
    let trees = items(child(node, "weakClassifiers")?)
        .map(parse_tree)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage { threshold, trees })
}

fn parse_tree(node: Node) -> Result<WeakTree, CascadeError> {
    let tokens: Vec<&str> = child_text(node, "internalNodes")?
        .split_whitespace()
        .collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(CascadeError::Invalid(format!(
            "internalNodes has {} values, expected a multiple of 4",
            tokens.len()
        )));
    }

    let nodes = tokens
        .chunks(4)
        .map(|c| {
            Ok(TreeNode {
                left: parse_one(c[0], "node left")?,
                right: parse_one(c[1], "node right")?,
                feature: parse_one(c[2], "node feature")?,
                threshold: parse_one(c[3], "node threshold")?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;

    let leaves = child_text(node, "leafValues")?
        .split_whitespace()
        .map(|t| parse_one(t, "leaf value"))
        .collect::<Result<Vec<f32>, _>>()?;

    Ok(WeakTree { nodes, leaves })
}

fn parse_feature(node: Node) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child_text(node, "tilted") {
        if tilted != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let text = r
                .text()
                .ok_or_else(|| CascadeError::Invalid("empty feature rect".into()))?;
            let t: Vec<&str> = text.split_whitespace().collect();
            if t.len() != 5 {
                return Err(CascadeError::Invalid(format!("feature rect {text:?}")));
            }
            Ok(WeightedRect {
                x: parse_one(t[0], "rect x")?,
                y: parse_one(t[1], "rect y")?,
                width: parse_one(t[2], "rect width")?,
                height: parse_one(t[3], "rect height")?,
                weight: parse_one(t[4], "rect weight")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

/// Summed-area tables of pixel values and squared pixel values.
///
/// Both tables carry an extra leading row and column of zeros.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub(crate) fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    pub(crate) fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        (table[y1 * stride + x1] + table[y0 * stride + x0])
            - (table[y0 * stride + x1] + table[y1 * stride + x0])
    }
}
