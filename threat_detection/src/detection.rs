use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Threat,
    Verified,
    Analyzing,
    /// Only produced when reading records written by other tools.
    #[serde(other)]
    Unknown,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Threat => "threat",
            DetectionStatus::Verified => "verified",
            DetectionStatus::Analyzing => "analyzing",
            DetectionStatus::Unknown => "unknown",
        }
    }
}

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection(other) / union
    }

    /// Clamps the box to `[0, width] x [0, height]`, keeping x1 <= x2 and y1 <= y2.
    /// NaN coordinates collapse onto the lower bound.
    pub fn clip(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x1.max(0.0).min(w);
        let y1 = self.y1.max(0.0).min(h);
        BoundingBox {
            x1,
            y1,
            x2: self.x2.max(x1).min(w),
            y2: self.y2.max(y1).min(h),
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Integer pixel region `(x, y, w, h)` covered by the box, `None` when empty.
    pub fn pixel_region(&self) -> Option<(u32, u32, u32, u32)> {
        let x = self.x1 as u32;
        let y = self.y1 as u32;
        let x2 = self.x2 as u32;
        let y2 = self.y2 as u32;
        if x2 <= x || y2 <= y {
            return None;
        }
        Some((x, y, x2 - x, y2 - y))
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [
            round_to(self.x1, 1),
            round_to(self.y1, 1),
            round_to(self.x2, 1),
            round_to(self.y2, 1),
        ]
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BoundingBox {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x1, y1, x2, y2] = <[f32; 4]>::deserialize(deserializer)?;
        Ok(Self { x1, y1, x2, y2 })
    }
}

/// Raw detector output for one box. Confidence is a percentage.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Best label of the secondary classifier for one crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: String,
    pub object_name: String,
    pub status: DetectionStatus,
    pub time_detected: String,
    pub confidence_score: f32,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vit_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vit_confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
    pub processing_time_ms: f64,
    pub image_width: u32,
    pub image_height: u32,
}

pub fn new_detection_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

pub fn round_ms(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_box_inside_image() {
        let clipped = BoundingBox::new(-10.0, 5.0, 120.0, 300.0).clip(100, 80);
        assert_eq!(clipped, BoundingBox::new(0.0, 5.0, 100.0, 80.0));
    }

    #[test]
    fn clip_collapses_box_outside_image() {
        let clipped = BoundingBox::new(150.0, 10.0, 200.0, 20.0).clip(100, 80);
        assert_eq!(clipped.width(), 0.0);
        assert!(clipped.pixel_region().is_none());
    }

    #[test]
    fn clip_tolerates_nan_coordinates() {
        let clipped = BoundingBox::new(f32::NAN, 5.0, f32::NAN, f32::NAN).clip(100, 80);
        assert_eq!(clipped, BoundingBox::new(0.0, 5.0, 0.0, 5.0));
        assert!(clipped.pixel_region().is_none());
        assert!(!BoundingBox::new(0.0, 0.0, f32::INFINITY, 1.0).is_finite());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn detection_serializes_with_camel_case_and_rounded_bbox() {
        let detection = Detection {
            id: "abcd1234".into(),
            object_name: "tank".into(),
            status: DetectionStatus::Verified,
            time_detected: "12:00:00".into(),
            confidence_score: 91.5,
            bbox: BoundingBox::new(1.26, 2.0, 3.04, 4.0),
            vit_label: None,
            vit_confidence: None,
        };
        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["objectName"], "tank");
        assert_eq!(json["status"], "verified");
        assert_eq!(json["bbox"][0].as_f64().unwrap() as f32, 1.3);
        assert!(json.get("vitLabel").is_none());
    }

    #[test]
    fn unknown_status_deserializes_from_foreign_values() {
        let status: DetectionStatus = serde_json::from_str("\"suspicious\"").unwrap();
        assert_eq!(status, DetectionStatus::Unknown);
    }

    #[test]
    fn detection_ids_are_short_tokens() {
        let id = new_detection_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, new_detection_id());
    }
}
