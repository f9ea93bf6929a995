use crate::architecture::BaseArchitecture;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct ModelSettings {
    pub model_dir: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    pub detector: DetectorSettings,
    pub classifier: ClassifierSettings,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

impl ModelSettings {
    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector.onnx_file)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector.labels_file)
    }

    pub fn backbone_path(&self) -> PathBuf {
        self.model_dir.join(&self.classifier.backbone_file)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.model_dir.join(&self.classifier.checkpoint_file)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.detector_path().exists() {
            return Err(format!("Model file not found: {:?}", self.detector_path()));
        }
        if !self.labels_path().exists() {
            return Err(format!("Labels file not found: {:?}", self.labels_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorSettings {
    pub onnx_file: String,
    pub labels_file: String,
    #[serde(default = "default_detector_input")]
    pub input_size: u32,
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_detector_output")]
    pub output_name: String,
}

fn default_detector_input() -> u32 {
    640
}

fn default_min_probability() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_detector_output() -> String {
    "output0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierSettings {
    /// Backbone the ONNX feature graph was exported from.
    #[serde(default)]
    pub arch: BaseArchitecture,
    pub backbone_file: String,
    pub checkpoint_file: String,
    #[serde(default = "default_classifier_input")]
    pub input_size: u32,
    #[serde(default = "default_feature_output")]
    pub output_name: String,
}

fn default_classifier_input() -> u32 {
    224
}

fn default_feature_output() -> String {
    "features".to_string()
}

/// Keyword and threshold configuration for the status heuristic.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StatusPolicy {
    #[serde(default = "default_threat_keywords")]
    pub threat_keywords: Vec<String>,
    #[serde(default = "default_threat_threshold")]
    pub threat_threshold: f32,
    #[serde(default = "default_verified_threshold")]
    pub verified_threshold: f32,
}

fn default_threat_keywords() -> Vec<String> {
    ["uav", "drone", "unknown", "aircraft"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_threat_threshold() -> f32 {
    80.0
}

fn default_verified_threshold() -> f32 {
    85.0
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            threat_keywords: default_threat_keywords(),
            threat_threshold: default_threat_threshold(),
            verified_threshold: default_verified_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationSettings {
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
}

fn default_font_size() -> f32 {
    16.0
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: default_font_size(),
        }
    }
}

/// Defaults applied to retrain requests that omit a parameter.
#[derive(Debug, Deserialize, Clone)]
pub struct TrainingSettings {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_unfreeze_epoch")]
    pub unfreeze_epoch: u32,
    #[serde(default = "default_val_split")]
    pub val_split: f32,
}

fn default_epochs() -> u32 {
    20
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f32 {
    3e-4
}

fn default_unfreeze_epoch() -> u32 {
    5
}

fn default_val_split() -> f32 {
    0.2
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            unfreeze_epoch: default_unfreeze_epoch(),
            val_split: default_val_split(),
        }
    }
}
