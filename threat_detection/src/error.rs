use thiserror::Error;

pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Media error: {0}")]
    Media(String),
    #[error("Internal failure: {0}")]
    Internal(String),
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

impl InferenceError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn media(msg: impl Into<String>) -> Self {
        Self::Media(msg.into())
    }
}
