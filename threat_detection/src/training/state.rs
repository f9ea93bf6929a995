use crate::error::{InferenceError, InferenceResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    #[default]
    Idle,
    Training,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingState {
    pub status: TrainingStatus,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub best_acc: f64,
    pub elapsed_sec: f64,
    pub message: String,
}

type EpochObserver = Arc<dyn Fn(u32) + Send + Sync>;

/// Lock-guarded training record shared by the worker and status polls.
#[derive(Clone, Default)]
pub struct TrainingMonitor {
    state: Arc<Mutex<TrainingState>>,
    on_epoch: Option<EpochObserver>,
}

impl TrainingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `observer` with each finished epoch number, outside the lock.
    pub fn with_epoch_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_epoch = Some(Arc::new(observer));
        self
    }

    pub fn snapshot(&self) -> TrainingState {
        self.state.lock().clone()
    }

    /// Moves to `training` unless a run is already active. `precheck` runs
    /// under the same lock; if it fails the record is left untouched.
    pub fn try_begin<F>(&self, total_epochs: u32, precheck: F) -> InferenceResult<TrainingState>
    where
        F: FnOnce() -> InferenceResult<()>,
    {
        let mut state = self.state.lock();
        if state.status == TrainingStatus::Training {
            return Err(InferenceError::Conflict(
                "Training already in progress".to_string(),
            ));
        }
        precheck()?;

        *state = TrainingState {
            status: TrainingStatus::Training,
            total_epochs,
            message: "Initialising...".to_string(),
            ..TrainingState::default()
        };
        Ok(state.clone())
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state.lock().message = message.into();
    }

    /// Replaces the per-epoch metrics in one step.
    pub fn record_epoch(&self, epoch: EpochMetrics) {
        {
            let mut state = self.state.lock();
            state.current_epoch = epoch.epoch;
            state.train_loss = round(epoch.train_loss, 4);
            state.train_acc = round(epoch.train_acc, 2);
            state.val_loss = round(epoch.val_loss, 4);
            state.val_acc = round(epoch.val_acc, 2);
            state.best_acc = round(epoch.best_acc, 2);
            state.elapsed_sec = round(epoch.elapsed_sec, 1);
            state.message = format!(
                "Epoch {}/{} - val_acc {:.2}%",
                epoch.epoch, state.total_epochs, epoch.val_acc
            );
        }
        if let Some(observer) = &self.on_epoch {
            observer(epoch.epoch);
        }
    }

    pub fn complete(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.status = TrainingStatus::Completed;
        state.message = message.into();
    }

    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.status = TrainingStatus::Failed;
        state.message = message.into();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpochMetrics {
    pub epoch: u32,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub best_acc: f64,
    pub elapsed_sec: f64,
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
