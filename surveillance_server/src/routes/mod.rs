mod detect;
mod feed;
mod health;
mod metrics;
mod model;
mod video;

use crate::{
    error::{ApiError, ApiResult},
    server::SharedState,
};
use axum::{
    extract::Multipart,
    routing::{get, post},
    Router,
};
use bytes::Bytes;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/detect", post(detect::detect))
        .route("/detect/annotated", post(detect::detect_annotated))
        .route("/detect/pipeline", post(detect::detect_pipeline))
        .route("/detect/video", post(video::detect_video))
        .route("/ws/feed", get(feed::ws_feed))
        .route("/model/info", get(model::model_info))
        .route("/model/classify", post(model::classify))
        .route("/model/transfer-learning", post(model::transfer_learning))
        .route("/model/retrain", post(model::retrain))
        .route("/model/train/status", get(model::train_status))
}

pub(crate) struct Upload {
    pub bytes: Bytes,
    pub filename: Option<String>,
}

/// Reads the multipart field named `file`.
pub(crate) async fn read_upload(mut multipart: Multipart) -> ApiResult<Upload> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().map(str::to_string);
            let bytes = field.bytes().await?;
            return Ok(Upload { bytes, filename });
        }
    }
    Err(ApiError::bad_request("Missing multipart field `file`"))
}

#[cfg(test)]
pub(crate) mod testing;
