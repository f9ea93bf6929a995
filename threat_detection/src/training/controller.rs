use super::{
    state::{TrainingMonitor, TrainingState},
    trainer::Trainer,
    TrainingRequest,
};
use crate::{
    architecture::BaseArchitecture,
    classifier::{ClassifierSlot, FeatureExtractor},
    error::{InferenceError, InferenceResult},
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread,
};

/// Starts background fine-tuning runs and installs their result.
#[derive(Clone)]
pub struct TrainingController {
    monitor: TrainingMonitor,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    slot: ClassifierSlot,
    arch: BaseArchitecture,
    checkpoint_path: PathBuf,
}

impl TrainingController {
    pub fn new(
        extractor: Option<Arc<dyn FeatureExtractor>>,
        slot: ClassifierSlot,
        arch: BaseArchitecture,
        checkpoint_path: PathBuf,
    ) -> Self {
        Self {
            monitor: TrainingMonitor::new(),
            extractor,
            slot,
            arch,
            checkpoint_path,
        }
    }

    /// Reports each finished epoch to `observer` as the worker records it.
    pub fn on_epoch<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.monitor = self.monitor.with_epoch_observer(observer);
        self
    }

    pub fn status(&self) -> TrainingState {
        self.monitor.snapshot()
    }

    pub fn monitor(&self) -> &TrainingMonitor {
        &self.monitor
    }

    /// Validates the request and launches a run on a dedicated thread.
    /// Returns the state as of the start.
    pub fn start(&self, request: TrainingRequest) -> InferenceResult<TrainingState> {
        let mut state = self.monitor.try_begin(request.epochs, || {
            request.validate()?;
            if !request.data_dir.is_dir() {
                return Err(InferenceError::invalid_input(format!(
                    "Dataset path not found: {}",
                    request.data_dir.display()
                )));
            }
            if self.extractor.is_none() {
                return Err(InferenceError::unavailable("feature backbone not loaded"));
            }
            Ok(())
        })?;

        let extractor = self
            .extractor
            .clone()
            .ok_or_else(|| InferenceError::unavailable("feature backbone not loaded"))?;
        let trainer = Trainer {
            extractor,
            arch: self.arch,
            checkpoint_path: self.checkpoint_path.clone(),
            request,
            monitor: self.monitor.clone(),
        };
        let monitor = self.monitor.clone();
        let slot = self.slot.clone();

        let spawned = thread::Builder::new()
            .name("classifier-training".to_string())
            .spawn(move || run_to_completion(trainer, monitor, slot));

        if let Err(e) = spawned {
            self.monitor
                .fail(format!("could not start training thread: {}", e));
            return Err(InferenceError::internal(e.to_string()));
        }

        tracing::info!("Training started for {} epochs", state.total_epochs);
        state.message =
            "Training started in background. Poll GET /model/train/status for progress."
                .to_string();
        Ok(state)
    }
}

fn run_to_completion(trainer: Trainer, monitor: TrainingMonitor, slot: ClassifierSlot) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| trainer.run()));
    match result {
        Ok(Ok(outcome)) => {
            slot.swap(Arc::new(outcome.classifier));
            monitor.complete(format!(
                "Training complete! Best val accuracy: {:.2}%. Model hot-swapped.",
                outcome.best_acc
            ));
            tracing::info!("Training completed, best val accuracy {:.2}%", outcome.best_acc);
        }
        Ok(Err(e)) => {
            tracing::error!("Training failed: {}", e);
            monitor.fail(e.to_string());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Training panicked: {}", message);
            monitor.fail(message);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "training thread panicked".to_string()
    }
}
