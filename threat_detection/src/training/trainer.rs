use super::{
    dataset::{self, Sample},
    optimizer::{AdamW, CosineSchedule},
    state::{EpochMetrics, TrainingMonitor},
    TrainingRequest,
};
use crate::{
    architecture::BaseArchitecture,
    checkpoint::ClassifierCheckpoint,
    classifier::{FeatureExtractor, VitClassifier},
    error::{InferenceError, InferenceResult},
    network::{smoothed_cross_entropy, HeadNetwork, LayerRole},
};
use ndarray::{Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{path::PathBuf, sync::Arc, time::Instant};

const LABEL_SMOOTHING: f32 = 0.1;
const WEIGHT_DECAY: f32 = 1e-4;
const UNFREEZE_LR_FACTOR: f32 = 0.1;

pub struct TrainOutcome {
    pub classifier: VitClassifier,
    pub best_acc: f64,
}

/// Embeddings computed once per run; the training split also keeps a
/// horizontally flipped view used as augmentation.
struct FeatureSet {
    features: Array2<f32>,
    flipped: Option<Array2<f32>>,
    labels: Vec<usize>,
}

impl FeatureSet {
    fn len(&self) -> usize {
        self.labels.len()
    }
}

/// One fine-tuning run of the classification head.
pub struct Trainer {
    pub(super) extractor: Arc<dyn FeatureExtractor>,
    pub(super) arch: BaseArchitecture,
    pub(super) checkpoint_path: PathBuf,
    pub(super) request: TrainingRequest,
    pub(super) monitor: TrainingMonitor,
}

impl Trainer {
    pub fn run(&self) -> InferenceResult<TrainOutcome> {
        let started = Instant::now();
        let request = &self.request;
        if self.extractor.feature_dim() != self.arch.feature_dim() {
            return Err(InferenceError::internal(format!(
                "backbone produces {} features, {} head expects {}",
                self.extractor.feature_dim(),
                self.arch,
                self.arch.feature_dim()
            )));
        }
        let mut rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        self.monitor.set_message("Preparing data...");
        let split = dataset::discover(&request.data_dir, request.val_split, &mut rng)?;
        let mut network = self.initial_network(&split.classes, &mut rng);

        self.monitor.set_message(format!(
            "Extracting features for {} images...",
            split.train.len() + split.val.len()
        ));
        let train = self.extract(&split.train, true)?;
        let val = self.extract(&split.val, false)?;

        let mut optimizer = AdamW::new(&network, request.learning_rate, WEIGHT_DECAY);
        let mut schedule = CosineSchedule::new(request.learning_rate, request.epochs);
        let mut best_acc = 0.0;

        for epoch in 0..request.epochs {
            if epoch == request.unfreeze_epoch {
                network.unfreeze_all();
                let lr = request.learning_rate * UNFREEZE_LR_FACTOR;
                optimizer = AdamW::new(&network, lr, WEIGHT_DECAY);
                schedule = CosineSchedule::new(lr, request.epochs - epoch);
                tracing::info!("Unfroze backbone adapter at epoch {}, lr {}", epoch, lr);
            }

            let (train_loss, train_acc) =
                train_epoch(&mut network, &mut optimizer, &train, request.batch_size, &mut rng);
            let (val_loss, val_acc) = evaluate(&network, &val, request.batch_size);
            optimizer.set_lr(schedule.step());

            if val_acc > best_acc {
                best_acc = val_acc;
                self.checkpoint(&split.classes, &network).save(&self.checkpoint_path)?;
                tracing::info!("New best val accuracy {:.2}% at epoch {}", val_acc, epoch + 1);
            }

            self.monitor.record_epoch(EpochMetrics {
                epoch: epoch + 1,
                train_loss,
                train_acc,
                val_loss,
                val_acc,
                best_acc,
                elapsed_sec: started.elapsed().as_secs_f64(),
            });
        }

        let classifier = VitClassifier::new(
            self.extractor.clone(),
            self.checkpoint(&split.classes, &network),
        )?;
        Ok(TrainOutcome {
            classifier,
            best_acc,
        })
    }

    /// Fresh head, seeded from the saved checkpoint. With the same label set
    /// every layer is reused; otherwise only the adapter can be.
    fn initial_network<R: Rng + ?Sized>(&self, classes: &[String], rng: &mut R) -> HeadNetwork {
        let mut network = self.arch.build_head(classes.len(), true, rng);
        if !self.checkpoint_path.exists() {
            return network;
        }

        match ClassifierCheckpoint::load(&self.checkpoint_path) {
            Ok(saved) if saved.arch == self.arch => {
                let roles: &[LayerRole] = if saved.classes == classes {
                    &[LayerRole::Backbone, LayerRole::Head]
                } else {
                    &[LayerRole::Backbone]
                };
                let copied = network.copy_compatible_from(&saved.network, roles);
                tracing::info!("Loaded {} layers from {}", copied, self.checkpoint_path.display());
                self.monitor
                    .set_message("Pretrained checkpoint loaded, preparing data...");
            }
            Ok(saved) => {
                tracing::warn!("Ignoring {} checkpoint for {} head", saved.arch, self.arch);
            }
            Err(e) => {
                tracing::warn!("Could not read checkpoint: {}", e);
            }
        }
        network
    }

    fn extract(&self, samples: &[Sample], with_flip: bool) -> InferenceResult<FeatureSet> {
        let dim = self.extractor.feature_dim();
        let mut features = Array2::zeros((samples.len(), dim));
        let mut flipped = with_flip.then(|| Array2::zeros((samples.len(), dim)));

        for (i, sample) in samples.iter().enumerate() {
            let image = image::open(&sample.path)
                .map_err(|e| {
                    InferenceError::invalid_input(format!(
                        "cannot read {}: {}",
                        sample.path.display(),
                        e
                    ))
                })?
                .to_rgb8();
            features.row_mut(i).assign(&self.extractor.extract(&image)?);
            if let Some(flipped) = flipped.as_mut() {
                let mirrored = image::imageops::flip_horizontal(&image);
                flipped.row_mut(i).assign(&self.extractor.extract(&mirrored)?);
            }
        }

        Ok(FeatureSet {
            features,
            flipped,
            labels: samples.iter().map(|s| s.label).collect(),
        })
    }

    fn checkpoint(&self, classes: &[String], network: &HeadNetwork) -> ClassifierCheckpoint {
        ClassifierCheckpoint {
            arch: self.arch,
            classes: classes.to_vec(),
            network: network.clone(),
        }
    }
}

fn batch_rows<R: Rng + ?Sized>(set: &FeatureSet, indices: &[usize], rng: &mut R) -> Array2<f32> {
    let mut batch = Array2::zeros((indices.len(), set.features.ncols()));
    for (row, &index) in indices.iter().enumerate() {
        let source = match &set.flipped {
            Some(flipped) if rng.random_bool(0.5) => flipped,
            _ => &set.features,
        };
        batch.row_mut(row).assign(&source.row(index));
    }
    batch
}

/// Returns mean loss and accuracy in percent.
fn train_epoch<R: Rng + ?Sized>(
    network: &mut HeadNetwork,
    optimizer: &mut AdamW,
    set: &FeatureSet,
    batch_size: usize,
    rng: &mut R,
) -> (f64, f64) {
    let mut order: Vec<usize> = (0..set.len()).collect();
    order.shuffle(rng);

    let mut loss_sum = 0.0;
    let mut correct = 0;
    for chunk in order.chunks(batch_size.max(1)) {
        let inputs = batch_rows(set, chunk, rng);
        let targets: Vec<usize> = chunk.iter().map(|&i| set.labels[i]).collect();

        let (logits, cache) = network.forward_train(inputs.view(), rng);
        let loss = smoothed_cross_entropy(&logits, &targets, LABEL_SMOOTHING);
        let grads = network.backward(&cache, loss.grad);
        optimizer.step(network, &grads);

        loss_sum += loss.loss_sum as f64;
        correct += loss.correct;
    }
    mean_metrics(loss_sum, correct, set.len())
}

fn evaluate(network: &HeadNetwork, set: &FeatureSet, batch_size: usize) -> (f64, f64) {
    let mut loss_sum = 0.0;
    let mut correct = 0;
    let rows: ArrayView2<f32> = set.features.view();
    for (chunk, labels) in rows
        .axis_chunks_iter(Axis(0), batch_size.max(1))
        .zip(set.labels.chunks(batch_size.max(1)))
    {
        let loss = smoothed_cross_entropy(&network.forward(chunk), labels, LABEL_SMOOTHING);
        loss_sum += loss.loss_sum as f64;
        correct += loss.correct;
    }
    mean_metrics(loss_sum, correct, set.len())
}

fn mean_metrics(loss_sum: f64, correct: usize, total: usize) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }
    (loss_sum / total as f64, correct as f64 / total as f64 * 100.0)
}
