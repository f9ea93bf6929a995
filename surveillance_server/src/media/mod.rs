//! Video decoding and encoding behind the [`VideoBackend`] seam.

mod ffmpeg;
mod job;
#[cfg(feature = "opencv")]
mod cv;
mod transcode;

pub use ffmpeg::{parse_frame_rate, FfmpegBackend};
pub use job::{EncodedVideo, VideoJob};
#[cfg(feature = "opencv")]
pub use cv::OpenCvBackend;
pub use transcode::Transcoder;

use crate::config::VideoBackendKind;
use std::{path::Path, sync::Arc};
use thiserror::Error;
use threat_detection::{FrameSink, FrameSource, InferenceError, VideoInfo};

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Unsupported video backend: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl MediaError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, MediaError::InvalidVideo(_))
    }
}

impl From<MediaError> for InferenceError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::InvalidVideo(msg) => InferenceError::invalid_input(msg),
            other => InferenceError::media(other.to_string()),
        }
    }
}

/// Opens uploaded videos for decoding and creates the intermediate
/// MPEG-4 output.
pub trait VideoBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn open(&self, path: &Path) -> MediaResult<Box<dyn FrameSource + Send>>;

    fn create(&self, path: &Path, info: &VideoInfo) -> MediaResult<Box<dyn FrameSink + Send>>;
}

pub fn select_backend(kind: VideoBackendKind) -> MediaResult<Arc<dyn VideoBackend>> {
    match kind {
        VideoBackendKind::Ffmpeg => Ok(Arc::new(FfmpegBackend::detect()?)),
        #[cfg(feature = "opencv")]
        VideoBackendKind::Opencv => Ok(Arc::new(OpenCvBackend)),
        #[cfg(not(feature = "opencv"))]
        VideoBackendKind::Opencv => Err(MediaError::Unsupported(
            "opencv (built without the `opencv` feature)".to_string(),
        )),
    }
}
