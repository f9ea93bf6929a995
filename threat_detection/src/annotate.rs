use crate::{
    detection::{Detection, DetectionStatus},
    error::{InferenceError, InferenceResult},
    settings::AnnotationSettings,
};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};

pub fn status_color(status: DetectionStatus) -> Rgb<u8> {
    match status {
        DetectionStatus::Threat => Rgb([255, 0, 0]),
        DetectionStatus::Verified => Rgb([0, 200, 0]),
        DetectionStatus::Analyzing => Rgb([255, 200, 0]),
        DetectionStatus::Unknown => Rgb([200, 200, 200]),
    }
}

/// Draws detection boxes and captions on a copy of an image.
pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Annotator {
    pub fn new(settings: &AnnotationSettings) -> InferenceResult<Self> {
        let font = match &settings.font_path {
            Some(path) => {
                let data = std::fs::read(path)?;
                let font = FontArc::try_from_vec(data).map_err(|e| {
                    InferenceError::invalid_input(format!(
                        "invalid font {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(font)
            }
            None => {
                tracing::warn!("No annotation font configured, labels will not be drawn");
                None
            }
        };

        Ok(Self {
            font,
            scale: PxScale::from(settings.font_size),
        })
    }

    /// Annotator that draws boxes only.
    pub fn boxes_only() -> Self {
        Self {
            font: None,
            scale: PxScale::from(16.0),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.clone();
        for detection in detections {
            self.draw(&mut canvas, detection);
        }
        canvas
    }

    fn draw(&self, canvas: &mut RgbImage, detection: &Detection) {
        let color = status_color(detection.status);
        let bbox = detection.bbox.clip(canvas.width(), canvas.height());
        let Some((x, y, width, height)) = bbox.pixel_region() else {
            return;
        };
        let (x, y) = (x as i32, y as i32);

        draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(width, height), color);
        if width > 2 && height > 2 {
            draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(width - 2, height - 2), color);
        }

        if let Some(font) = &self.font {
            let label = format!(
                "{} {:.0}%",
                detection.object_name, detection.confidence_score
            );
            let text_y = (y - self.scale.y as i32 - 2).max(0);
            draw_text_mut(canvas, color, x, text_y, self.scale, font, &label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn detection(status: DetectionStatus, bbox: BoundingBox) -> Detection {
        Detection {
            id: "00000000".into(),
            object_name: "drone".into(),
            status,
            time_detected: "00:00:00".into(),
            confidence_score: 95.0,
            bbox,
            vit_label: None,
            vit_confidence: None,
        }
    }

    #[test]
    fn colors_follow_status() {
        assert_eq!(status_color(DetectionStatus::Threat), Rgb([255, 0, 0]));
        assert_eq!(status_color(DetectionStatus::Verified), Rgb([0, 200, 0]));
        assert_eq!(status_color(DetectionStatus::Analyzing), Rgb([255, 200, 0]));
        assert_eq!(status_color(DetectionStatus::Unknown), Rgb([200, 200, 200]));
    }

    #[test]
    fn annotate_draws_on_a_copy() {
        let source = RgbImage::new(50, 50);
        let annotator = Annotator::boxes_only();
        let annotated = annotator.annotate(
            &source,
            &[detection(DetectionStatus::Threat, BoundingBox::new(10.0, 10.0, 30.0, 30.0))],
        );

        assert_eq!(annotated.get_pixel(10, 10), &Rgb([255, 0, 0]));
        assert_eq!(annotated.get_pixel(11, 20), &Rgb([255, 0, 0]));
        assert_eq!(annotated.get_pixel(20, 20), &Rgb([0, 0, 0]));
        assert_eq!(source.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn annotate_skips_degenerate_and_clips_oversized_boxes() {
        let source = RgbImage::new(20, 20);
        let annotator = Annotator::boxes_only();
        let annotated = annotator.annotate(
            &source,
            &[
                detection(DetectionStatus::Verified, BoundingBox::new(5.0, 5.0, 5.0, 9.0)),
                detection(DetectionStatus::Verified, BoundingBox::new(-5.0, -5.0, 40.0, 40.0)),
            ],
        );
        assert_eq!(annotated.get_pixel(0, 0), &Rgb([0, 200, 0]));
        assert_eq!(annotated.get_pixel(5, 7), &Rgb([0, 0, 0]));
    }

    #[test]
    fn missing_font_file_is_an_error() {
        let settings = AnnotationSettings {
            font_path: Some("/nonexistent/font.ttf".into()),
            font_size: 12.0,
        };
        assert!(Annotator::new(&settings).is_err());
        assert!(!Annotator::new(&AnnotationSettings::default()).unwrap().has_font());
    }
}
