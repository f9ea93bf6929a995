use crate::{
    detection::{Classification, DetectionStatus, RawDetection},
    settings::StatusPolicy,
};

/// Decision for one box once detector and classifier outputs are combined.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedLabel {
    pub label: String,
    pub confidence: f32,
    pub secondary: Option<Classification>,
}

/// Picks the classifier result when it is strictly more confident than the
/// detector. Without a classifier result the detector output is used as-is.
pub fn fuse(detector: &RawDetection, classifier: Option<Classification>) -> FusedLabel {
    match classifier {
        Some(secondary) if secondary.confidence > detector.confidence => FusedLabel {
            label: secondary.label.clone(),
            confidence: secondary.confidence,
            secondary: Some(secondary),
        },
        secondary => FusedLabel {
            label: detector.label.clone(),
            confidence: detector.confidence,
            secondary,
        },
    }
}

impl StatusPolicy {
    pub fn status(&self, label: &str, confidence: f32) -> DetectionStatus {
        let label = label.to_lowercase();
        let keyword_hit = self
            .threat_keywords
            .iter()
            .any(|keyword| label.contains(keyword.as_str()));

        if keyword_hit && confidence > self.threat_threshold {
            DetectionStatus::Threat
        } else if confidence > self.verified_threshold {
            DetectionStatus::Verified
        } else {
            DetectionStatus::Analyzing
        }
    }
}
