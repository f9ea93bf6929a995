mod controller;
mod dataset;
mod optimizer;
mod state;
mod trainer;

pub use controller::TrainingController;
pub use dataset::{discover, DatasetSplit, Sample};
pub use optimizer::{AdamW, CosineSchedule};
pub use state::{EpochMetrics, TrainingMonitor, TrainingState, TrainingStatus};

use crate::{
    error::{InferenceError, InferenceResult},
    settings::TrainingSettings,
};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub data_dir: PathBuf,
    pub epochs: u32,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub unfreeze_epoch: u32,
    pub val_split: f32,
    /// Fixes the split and shuffling order; OS-seeded when absent.
    pub seed: Option<u64>,
}

impl TrainingRequest {
    pub fn with_defaults(data_dir: PathBuf, defaults: &TrainingSettings) -> Self {
        Self {
            data_dir,
            epochs: defaults.epochs,
            batch_size: defaults.batch_size,
            learning_rate: defaults.learning_rate,
            unfreeze_epoch: defaults.unfreeze_epoch,
            val_split: defaults.val_split,
            seed: None,
        }
    }

    pub fn validate(&self) -> InferenceResult<()> {
        if self.epochs == 0 {
            return Err(InferenceError::invalid_input("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(InferenceError::invalid_input("batch_size must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(InferenceError::invalid_input("lr must be positive"));
        }
        if !(0.0..1.0).contains(&self.val_split) {
            return Err(InferenceError::invalid_input(
                "val_split must be in [0, 1)",
            ));
        }
        Ok(())
    }
}
