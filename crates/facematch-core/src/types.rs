use crate::crop::DisplayCrop;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side length of a normalized face patch, in pixels.
pub const PATCH_SIZE: u32 = 200;

/// Axis-aligned face region in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Clip the rectangle to a `width` × `height` image.
    ///
    /// Returns `None` when nothing of the rectangle lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let x1 = self.right().min(width);
        let y1 = self.bottom().min(height);
        if self.x >= x1 || self.y >= y1 {
            return None;
        }
        Some(Rect::new(self.x, self.y, x1 - self.x, y1 - self.y))
    }
}

/// A 200×200 normalized grayscale face patch.
///
/// Only produced by [`crate::normalize`]; training-time and query-time
/// patches therefore always share one preprocessing path.
#[derive(Debug, Clone, PartialEq)]
pub struct FacePatch {
    image: GrayImage,
}

impl FacePatch {
    pub(crate) fn from_image(image: GrayImage) -> Self {
        debug_assert_eq!(image.dimensions(), (PATCH_SIZE, PATCH_SIZE));
        Self { image }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Row-major pixel data, `PATCH_SIZE * PATCH_SIZE` bytes.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Dense model label. Labels run `0..K` with no gaps.
pub type Label = u32;

/// Model output for one patch. Lower confidence means a closer match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub confidence: f64,
}

/// Confidence band a recognized face fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Below the strict threshold and confirmed by the cross-validator.
    Strict,
    /// Below the moderate threshold, accepted on model confidence alone.
    Moderate,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strict => "strict",
            Tier::Moderate => "moderate",
        }
    }
}

/// Label → identity name, indexed by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next free label to `name`.
    pub fn commit(&mut self, name: impl Into<String>) -> Label {
        self.names.push(name.into());
        (self.names.len() - 1) as Label
    }

    pub fn name(&self, label: Label) -> Option<&str> {
        self.names.get(label as usize).map(String::as_str)
    }

    pub fn label_of(&self, name: &str) -> Option<Label> {
        self.names.iter().position(|n| n == name).map(|i| i as Label)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as Label, n.as_str()))
    }
}

/// Outcome of identifying one query image.
#[derive(Debug, Clone)]
pub enum IdentificationResult {
    NoFaceDetected,
    /// Faces were found but no identity has a trained label.
    NoEnrollmentData { face_crop: Option<DisplayCrop> },
    Recognized {
        identity: String,
        confidence: f64,
        tier: Tier,
        face_crop: Option<DisplayCrop>,
    },
    Unrecognized { face_crop: Option<DisplayCrop> },
}

impl IdentificationResult {
    pub fn is_recognized(&self) -> bool {
        matches!(self, IdentificationResult::Recognized { .. })
    }

    pub fn face_crop(&self) -> Option<&DisplayCrop> {
        match self {
            IdentificationResult::NoFaceDetected => None,
            IdentificationResult::NoEnrollmentData { face_crop }
            | IdentificationResult::Recognized { face_crop, .. }
            | IdentificationResult::Unrecognized { face_crop } => face_crop.as_ref(),
        }
    }

    /// Human-readable message for the caller's UI.
    pub fn message(&self) -> String {
        match self {
            IdentificationResult::NoFaceDetected => "No face detected.".to_string(),
            IdentificationResult::NoEnrollmentData { .. } => {
                "No face data available. Enroll identities to enable recognition.".to_string()
            }
            IdentificationResult::Recognized {
                identity,
                confidence,
                tier: Tier::Strict,
                ..
            } => format!("Identified: {identity} [Confidence: {confidence:.2}]"),
            IdentificationResult::Recognized {
                identity,
                confidence,
                tier: Tier::Moderate,
                ..
            } => format!("Identified: {identity} [Confidence: {confidence:.2}] (Moderate match)"),
            IdentificationResult::Unrecognized { .. } => {
                "Face not recognized. (Try adding more images or check lighting)".to_string()
            }
        }
    }

    pub fn to_response(&self) -> IdentifyResponse {
        let (name, confidence, tier) = match self {
            IdentificationResult::Recognized {
                identity,
                confidence,
                tier,
                ..
            } => (Some(identity.clone()), Some(*confidence), Some(*tier)),
            _ => (None, None, None),
        };
        IdentifyResponse {
            recognized: self.is_recognized(),
            name,
            confidence,
            tier,
            message: self.message(),
            face_image: self.face_crop().map(DisplayCrop::to_base64),
            error: None,
        }
    }
}

/// Wire form of an identification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub message: String,
    pub face_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IdentifyResponse {
    /// Response for a query rejected before identification started.
    pub fn rejected(error: impl std::fmt::Display) -> Self {
        Self {
            recognized: false,
            name: None,
            confidence: None,
            tier: None,
            message: error.to_string(),
            face_image: None,
            error: Some(error.to_string()),
        }
    }

    /// Response for an unexpected failure inside the pipeline.
    pub fn internal_error(error: impl std::fmt::Display) -> Self {
        Self {
            recognized: false,
            name: None,
            confidence: None,
            tier: None,
            message: "Internal error. Please try again.".to_string(),
            face_image: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_clamp_inside() {
        let r = Rect::new(10, 10, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(r));
    }

    #[test]
    fn test_rect_clamp_overhang() {
        let r = Rect::new(90, 95, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(Rect::new(90, 95, 10, 5)));
    }

    #[test]
    fn test_rect_clamp_outside() {
        assert_eq!(Rect::new(100, 0, 5, 5).clamp_to(100, 100), None);
        assert_eq!(Rect::new(0, 0, 0, 5).clamp_to(100, 100), None);
    }

    #[test]
    fn test_label_map_dense_labels() {
        let mut map = LabelMap::new();
        assert!(map.is_empty());
        assert_eq!(map.commit("alice"), 0);
        assert_eq!(map.commit("bob"), 1);
        assert_eq!(map.len(), 2);
        assert_eq!(map.name(1), Some("bob"));
        assert_eq!(map.name(2), None);
        assert_eq!(map.label_of("alice"), Some(0));
        assert_eq!(map.label_of("carol"), None);
        let labels: Vec<Label> = map.iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn test_messages_distinguish_tiers() {
        let strict = IdentificationResult::Recognized {
            identity: "alice".into(),
            confidence: 42.123,
            tier: Tier::Strict,
            face_crop: None,
        };
        let moderate = IdentificationResult::Recognized {
            identity: "alice".into(),
            confidence: 90.0,
            tier: Tier::Moderate,
            face_crop: None,
        };
        assert_eq!(strict.message(), "Identified: alice [Confidence: 42.12]");
        assert_eq!(
            moderate.message(),
            "Identified: alice [Confidence: 90.00] (Moderate match)"
        );
    }

    #[test]
    fn test_response_recognized() {
        let result = IdentificationResult::Recognized {
            identity: "alice".into(),
            confidence: 12.5,
            tier: Tier::Strict,
            face_crop: None,
        };
        let resp = result.to_response();
        assert!(resp.recognized);
        assert_eq!(resp.name.as_deref(), Some("alice"));
        assert_eq!(resp.confidence, Some(12.5));
        assert_eq!(resp.tier, Some(Tier::Strict));
        assert!(resp.error.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["tier"], "strict");
    }

    #[test]
    fn test_response_unrecognized_has_no_identity() {
        let resp = IdentificationResult::Unrecognized { face_crop: None }.to_response();
        assert!(!resp.recognized);
        assert!(resp.name.is_none());
        assert!(resp.confidence.is_none());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("name").is_none());
        assert!(json["face_image"].is_null());
    }

    #[test]
    fn test_internal_error_distinct_from_unrecognized() {
        let unrecognized = IdentificationResult::Unrecognized { face_crop: None }.to_response();
        let failed = IdentifyResponse::internal_error("boom");
        assert_ne!(unrecognized.message, failed.message);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(unrecognized.error.is_none());
    }
}
