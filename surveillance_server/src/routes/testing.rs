use crate::{
    server::{build_router, ModelContext, SharedState},
    telemetry::Metrics,
};
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, path::PathBuf, sync::Arc};
use threat_detection::{
    detection::RawDetection, settings::StatusPolicy, settings::TrainingSettings, Annotator,
    BaseArchitecture, BoundingBox, Classifier, ClassifierSlot, Detector, ImagePipeline,
    InferenceResult, TrainingController,
};

pub struct FixedDetector(pub Vec<RawDetection>);

impl Detector for FixedDetector {
    fn detect(&self, _image: &RgbImage) -> InferenceResult<Vec<RawDetection>> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

pub struct FixedClassifier {
    pub labels: Vec<String>,
    pub probabilities: Vec<f32>,
}

impl Classifier for FixedClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn predict(&self, _image: &RgbImage) -> InferenceResult<Vec<f32>> {
        Ok(self.probabilities.clone())
    }
}

pub fn airplane_at_90() -> Vec<RawDetection> {
    vec![RawDetection {
        label: "airplane".to_string(),
        confidence: 90.0,
        bbox: BoundingBox::new(8.0, 8.0, 40.0, 40.0),
    }]
}

pub fn drone_classifier() -> Arc<dyn Classifier> {
    Arc::new(FixedClassifier {
        labels: vec!["drone".to_string(), "tank".to_string()],
        probabilities: vec![0.95, 0.05],
    })
}

pub fn state_with(
    detections: Vec<RawDetection>,
    classifier: Option<Arc<dyn Classifier>>,
) -> SharedState {
    let slot = ClassifierSlot::new(classifier);
    let checkpoint_path = PathBuf::from("models/vit_classifier.json");
    let metrics = Arc::new(Metrics::new().unwrap());
    let epoch_metrics = metrics.clone();
    SharedState {
        pipeline: ImagePipeline::new(
            Arc::new(FixedDetector(detections)),
            slot.clone(),
            StatusPolicy::default(),
            Arc::new(Annotator::boxes_only()),
        ),
        training: TrainingController::new(
            None,
            slot,
            BaseArchitecture::Vit,
            checkpoint_path.clone(),
        )
        .on_epoch(move |epoch| epoch_metrics.record_training_epoch(epoch)),
        training_defaults: TrainingSettings::default(),
        video: None,
        models: Arc::new(ModelContext {
            device: "cpu".to_string(),
            checkpoint_path,
        }),
        metrics,
        max_upload_bytes: 8 * 1024 * 1024,
    }
}

pub fn router_with(
    detections: Vec<RawDetection>,
    classifier: Option<Arc<dyn Classifier>>,
) -> Router {
    build_router(state_with(detections, classifier))
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([90, 120, 60]));
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

pub fn multipart_request(uri: &str, field: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "threat-detection-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
