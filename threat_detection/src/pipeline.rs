use crate::{
    annotate::Annotator,
    classifier::{Classifier, ClassifierSlot},
    detection::{new_detection_id, round_ms, Detection, DetectionResponse, RawDetection},
    detector::Detector,
    error::{InferenceError, InferenceResult},
    fusion::fuse,
    settings::StatusPolicy,
};
use image::RgbImage;
use serde::Serialize;
use std::{sync::Arc, time::Instant};

/// Decodes any supported image format to RGB8.
pub fn decode_image(bytes: &[u8]) -> InferenceResult<RgbImage> {
    if bytes.is_empty() {
        return Err(InferenceError::invalid_input("Invalid image file: empty upload"));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| InferenceError::invalid_input(format!("Invalid image file: {}", e)))?;
    Ok(image.to_rgb8())
}

fn time_of_day() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn elapsed_ms(start: Instant) -> f64 {
    round_ms(start.elapsed().as_secs_f64() * 1000.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    pub annotate: bool,
    pub keep_crops: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub detector_ms: f64,
    pub classifier_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone)]
pub struct AnalyzedBox {
    pub detection: Detection,
    pub detector_label: String,
    pub detector_confidence: f32,
    pub crop: Option<RgbImage>,
}

#[derive(Debug, Clone)]
pub struct ImageAnalysis {
    pub boxes: Vec<AnalyzedBox>,
    pub annotated: Option<RgbImage>,
    pub timings: StageTimings,
    pub width: u32,
    pub height: u32,
}

impl ImageAnalysis {
    pub fn detections(&self) -> Vec<Detection> {
        self.boxes.iter().map(|b| b.detection.clone()).collect()
    }

    pub fn into_response(self) -> DetectionResponse {
        DetectionResponse {
            detections: self.boxes.into_iter().map(|b| b.detection).collect(),
            processing_time_ms: self.timings.total_ms,
            image_width: self.width,
            image_height: self.height,
        }
    }
}

/// Detector, per-box classifier, status policy and annotator for one image.
#[derive(Clone)]
pub struct ImagePipeline {
    detector: Arc<dyn Detector>,
    classifier: ClassifierSlot,
    policy: StatusPolicy,
    annotator: Arc<Annotator>,
}

impl ImagePipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        classifier: ClassifierSlot,
        policy: StatusPolicy,
        annotator: Arc<Annotator>,
    ) -> Self {
        Self {
            detector,
            classifier,
            policy,
            annotator,
        }
    }

    pub fn classifier(&self) -> &ClassifierSlot {
        &self.classifier
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    pub fn annotator(&self) -> &Annotator {
        &self.annotator
    }

    pub fn analyze_bytes(&self, bytes: &[u8], options: AnalyzeOptions) -> InferenceResult<ImageAnalysis> {
        let image = decode_image(bytes)?;
        self.analyze(&image, options)
    }

    #[tracing::instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn analyze(&self, image: &RgbImage, options: AnalyzeOptions) -> InferenceResult<ImageAnalysis> {
        let total_start = Instant::now();
        let (width, height) = image.dimensions();

        let detector_start = Instant::now();
        let raw = self.detector.detect(image)?;
        let detector_ms = elapsed_ms(detector_start);

        // One snapshot for the whole image.
        let classifier = self.classifier.current();
        let classifier_start = Instant::now();
        let boxes: Vec<AnalyzedBox> = raw
            .iter()
            .map(|detection| self.analyze_box(image, detection, classifier.as_deref(), options))
            .collect();
        let classifier_ms = elapsed_ms(classifier_start);

        let annotated = options.annotate.then(|| {
            let detections: Vec<Detection> = boxes.iter().map(|b| b.detection.clone()).collect();
            self.annotator.annotate(image, &detections)
        });

        tracing::debug!("Analyzed {} boxes", boxes.len());

        Ok(ImageAnalysis {
            boxes,
            annotated,
            timings: StageTimings {
                detector_ms,
                classifier_ms,
                total_ms: elapsed_ms(total_start),
            },
            width,
            height,
        })
    }

    fn analyze_box(
        &self,
        image: &RgbImage,
        raw: &RawDetection,
        classifier: Option<&dyn Classifier>,
        options: AnalyzeOptions,
    ) -> AnalyzedBox {
        let bbox = raw.bbox.clip(image.width(), image.height());
        let crop = bbox
            .pixel_region()
            .map(|(x, y, w, h)| image::imageops::crop_imm(image, x, y, w, h).to_image());

        let secondary = match (classifier, &crop) {
            (Some(classifier), Some(crop)) => match classifier.classify(crop) {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!("Classifier failed on {} crop: {}", raw.label, e);
                    None
                }
            },
            (Some(_), None) => {
                tracing::debug!("Skipping classification of empty {} crop", raw.label);
                None
            }
            _ => None,
        };

        let fused = fuse(raw, secondary);
        let status = self.policy.status(&fused.label, fused.confidence);

        AnalyzedBox {
            detection: Detection {
                id: new_detection_id(),
                object_name: fused.label,
                status,
                time_detected: time_of_day(),
                confidence_score: fused.confidence,
                bbox,
                vit_label: fused.secondary.as_ref().map(|c| c.label.clone()),
                vit_confidence: fused.secondary.as_ref().map(|c| c.confidence),
            },
            detector_label: raw.label.clone(),
            detector_confidence: raw.confidence,
            crop: if options.keep_crops { crop } else { None },
        }
    }
}
