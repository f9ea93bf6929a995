mod session_pool;

pub mod annotate;
pub mod architecture;
pub mod checkpoint;
pub mod classifier;
pub mod detection;
pub mod detector;
pub mod error;
pub mod fusion;
pub mod network;
pub mod pipeline;
pub mod settings;
pub mod training;
pub mod video;

pub use annotate::Annotator;
pub use architecture::{ArchitectureSummary, BaseArchitecture};
pub use classifier::{Classifier, ClassifierSlot, FeatureExtractor, OrtFeatureExtractor, VitClassifier};
pub use detection::{BoundingBox, Detection, DetectionResponse, DetectionStatus};
pub use detector::{Detector, OrtDetector};
pub use error::{InferenceError, InferenceResult};
pub use pipeline::{AnalyzeOptions, ImageAnalysis, ImagePipeline};
pub use training::{TrainingController, TrainingRequest, TrainingState, TrainingStatus};
pub use video::{FrameSink, FrameSource, VideoInfo, VideoOptions, VideoPipeline, VideoReport};
