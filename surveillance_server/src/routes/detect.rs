use super::read_upload;
use crate::{
    encoding::{
        jpeg_base64, jpeg_bytes, thumbnail, ANNOTATED_JPEG_QUALITY, CROP_JPEG_QUALITY,
        CROP_MAX_SIDE,
    },
    error::{ApiError, ApiResult},
    server::{ModelInfo, SharedState},
};
use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use threat_detection::{
    pipeline::AnalyzedBox, AnalyzeOptions, BoundingBox, Detection, DetectionResponse,
    DetectionStatus,
};
use tracing::instrument;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CropInfo {
    id: String,
    object_name: String,
    yolo_label: String,
    yolo_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    vit_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vit_confidence: Option<f32>,
    status: DetectionStatus,
    bbox: BoundingBox,
    crop_base64: String,
}

impl CropInfo {
    fn from_box(analyzed: &AnalyzedBox) -> ApiResult<Self> {
        let crop_base64 = match &analyzed.crop {
            Some(crop) => jpeg_base64(&thumbnail(crop, CROP_MAX_SIDE), CROP_JPEG_QUALITY)?,
            None => String::new(),
        };
        let detection = &analyzed.detection;
        Ok(Self {
            id: detection.id.clone(),
            object_name: detection.object_name.clone(),
            yolo_label: analyzed.detector_label.clone(),
            yolo_confidence: analyzed.detector_confidence,
            vit_label: detection.vit_label.clone(),
            vit_confidence: detection.vit_confidence,
            status: detection.status,
            bbox: detection.bbox,
            crop_base64,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    detections: Vec<Detection>,
    crops: Vec<CropInfo>,
    annotated_image_base64: String,
    processing_time_ms: f64,
    yolo_time_ms: f64,
    vit_time_ms: f64,
    image_width: u32,
    image_height: u32,
    model_info: ModelInfo,
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<DetectionResponse>> {
    state.metrics.record_request("/detect");
    let upload = read_upload(multipart).await?;

    let pipeline = state.pipeline.clone();
    let analysis = tokio::task::spawn_blocking(move || {
        pipeline.analyze_bytes(&upload.bytes, AnalyzeOptions::default())
    })
    .await??;

    state.metrics.record_stage_timings(&analysis.timings, "/detect");
    Ok(Json(analysis.into_response()))
}

#[instrument(skip(state, multipart))]
pub async fn detect_annotated(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    state.metrics.record_request("/detect/annotated");
    let upload = read_upload(multipart).await?;

    let pipeline = state.pipeline.clone();
    let (timings, jpeg) = tokio::task::spawn_blocking(move || -> ApiResult<_> {
        let options = AnalyzeOptions {
            annotate: true,
            keep_crops: false,
        };
        let analysis = pipeline.analyze_bytes(&upload.bytes, options)?;
        let annotated = analysis
            .annotated
            .as_ref()
            .ok_or_else(|| ApiError::internal("annotation was not produced"))?;
        Ok((analysis.timings, jpeg_bytes(annotated, ANNOTATED_JPEG_QUALITY)?))
    })
    .await??;

    state
        .metrics
        .record_stage_timings(&timings, "/detect/annotated");
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

#[instrument(skip(state, multipart))]
pub async fn detect_pipeline(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<PipelineResponse>> {
    state.metrics.record_request("/detect/pipeline");
    let upload = read_upload(multipart).await?;

    let pipeline = state.pipeline.clone();
    let (analysis, crops, annotated_image_base64) =
        tokio::task::spawn_blocking(move || -> ApiResult<_> {
            let options = AnalyzeOptions {
                annotate: true,
                keep_crops: true,
            };
            let analysis = pipeline.analyze_bytes(&upload.bytes, options)?;
            let crops = analysis
                .boxes
                .iter()
                .map(CropInfo::from_box)
                .collect::<ApiResult<Vec<_>>>()?;
            let annotated = match &analysis.annotated {
                Some(image) => jpeg_base64(image, ANNOTATED_JPEG_QUALITY)?,
                None => String::new(),
            };
            Ok((analysis, crops, annotated))
        })
        .await??;

    state
        .metrics
        .record_stage_timings(&analysis.timings, "/detect/pipeline");
    Ok(Json(PipelineResponse {
        detections: analysis.detections(),
        crops,
        annotated_image_base64,
        processing_time_ms: analysis.timings.total_ms,
        yolo_time_ms: analysis.timings.detector_ms,
        vit_time_ms: analysis.timings.classifier_ms,
        image_width: analysis.width,
        image_height: analysis.height,
        model_info: state.model_info(),
    }))
}
