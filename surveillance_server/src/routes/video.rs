use super::read_upload;
use crate::{
    encoding::{jpeg_base64, to_base64, ANNOTATED_JPEG_QUALITY},
    error::ApiResult,
    server::{ModelInfo, SharedState},
};
use axum::{
    extract::{Multipart, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use threat_detection::{
    detection::round_ms,
    video::{FrameRecord, VideoSummary},
    InferenceError, VideoOptions, VideoPipeline,
};
use tracing::instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoQuery {
    #[serde(alias = "frame_interval")]
    frame_interval: Option<u32>,
    #[serde(alias = "confidence")]
    confidence_threshold: Option<f32>,
}

impl VideoQuery {
    fn options(&self) -> VideoOptions {
        let defaults = VideoOptions::default();
        VideoOptions {
            frame_interval: self.frame_interval.unwrap_or(defaults.frame_interval),
            confidence_threshold: self
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResponse {
    annotated_video_base64: String,
    thumbnail_base64: String,
    frames: Vec<FrameRecord>,
    summary: VideoSummary,
    processing_time_ms: f64,
    fps: f64,
    total_frames: u64,
    width: u32,
    height: u32,
    model_info: ModelInfo,
    video_codec: &'static str,
}

#[instrument(skip(state, multipart))]
pub async fn detect_video(
    State(state): State<SharedState>,
    Query(query): Query<VideoQuery>,
    multipart: Multipart,
) -> ApiResult<Json<VideoResponse>> {
    state.metrics.record_request("/detect/video");
    let options = query.options();
    options.validate()?;
    let job = state
        .video
        .clone()
        .ok_or_else(|| InferenceError::unavailable("video processing backend not available"))?;

    let started = Instant::now();
    let upload = read_upload(multipart).await?;
    let encoded = job
        .run(
            VideoPipeline::new(state.pipeline.clone()),
            upload.bytes,
            upload.filename.as_deref(),
            options,
        )
        .await?;

    let report = encoded.report;
    state.metrics.record_video_frames(report.total_frames);
    let thumbnail_base64 = match &report.thumbnail {
        Some(thumbnail) => jpeg_base64(thumbnail, ANNOTATED_JPEG_QUALITY)?,
        None => String::new(),
    };

    Ok(Json(VideoResponse {
        annotated_video_base64: to_base64(&encoded.bytes),
        thumbnail_base64,
        frames: report.frames,
        summary: report.summary,
        processing_time_ms: round_ms(started.elapsed().as_secs_f64() * 1000.0),
        fps: (report.fps * 100.0).round() / 100.0,
        total_frames: report.total_frames,
        width: report.info.width,
        height: report.info.height,
        model_info: state.model_info(),
        video_codec: encoded.codec,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_accepts_both_parameter_spellings() {
        let camel: VideoQuery =
            serde_json::from_str(r#"{"frameInterval":3,"confidenceThreshold":40}"#).unwrap();
        assert_eq!(camel.options().frame_interval, 3);
        assert_eq!(camel.options().confidence_threshold, 40.0);

        let snake: VideoQuery =
            serde_json::from_str(r#"{"frame_interval":2,"confidence":10}"#).unwrap();
        assert_eq!(snake.options().frame_interval, 2);
        assert_eq!(snake.options().confidence_threshold, 10.0);
    }

    #[test]
    fn missing_parameters_use_defaults() {
        let empty: VideoQuery = serde_json::from_str("{}").unwrap();
        let options = empty.options();
        assert_eq!(options.frame_interval, 5);
        assert_eq!(options.confidence_threshold, 25.0);
    }
}
