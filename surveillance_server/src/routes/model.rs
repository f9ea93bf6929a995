use super::read_upload;
use crate::{error::ApiResult, server::SharedState};
use axum::{
    extract::{Multipart, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Instant};
use threat_detection::{
    checkpoint::ClassifierCheckpoint,
    detection::{round_ms, round_to},
    network::LayerRole,
    pipeline::decode_image,
    ArchitectureSummary, BaseArchitecture, InferenceError, TrainingRequest, TrainingState,
};
use tracing::instrument;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArchResponse {
    #[serde(flatten)]
    summary: ArchitectureSummary,
    num_classes: usize,
    classes: Vec<String>,
    device: String,
    weights_path: String,
    weights_loaded: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyResponse {
    predicted_class: String,
    confidence: f32,
    all_probabilities: BTreeMap<String, f32>,
    inference_time_ms: f64,
    model_used: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLearningRequest {
    #[serde(default = "default_arch")]
    arch: String,
    #[serde(default = "default_freeze_base")]
    freeze_base: bool,
}

fn default_arch() -> String {
    "vit".to_string()
}

fn default_freeze_base() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLearningResponse {
    architecture: String,
    total_params: usize,
    trainable_params: usize,
    frozen_params: usize,
    frozen_pct: f64,
    num_classes: usize,
    classes: Vec<String>,
    head_architecture: String,
    pretrained_weights_loaded: bool,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct RetrainQuery {
    data_dir: PathBuf,
    epochs: Option<u32>,
    batch_size: Option<usize>,
    lr: Option<f32>,
    unfreeze_epoch: Option<u32>,
    val_split: Option<f32>,
    seed: Option<u64>,
}

/// `1234567` as `1,234,567`.
fn group_digits(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn not_loaded() -> InferenceError {
    InferenceError::unavailable("ViT model not loaded")
}

#[instrument(skip(state))]
pub async fn model_info(State(state): State<SharedState>) -> ApiResult<Json<ModelArchResponse>> {
    state.metrics.record_request("/model/info");
    let classifier = state.pipeline.classifier().current().ok_or_else(not_loaded)?;
    let summary = classifier.summary().ok_or_else(not_loaded)?;
    let classes = classifier.labels().to_vec();

    Ok(Json(ModelArchResponse {
        summary,
        num_classes: classes.len(),
        classes,
        device: state.models.device.clone(),
        weights_path: state.models.checkpoint_path.display().to_string(),
        weights_loaded: true,
    }))
}

#[instrument(skip(state, multipart))]
pub async fn classify(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> ApiResult<Json<ClassifyResponse>> {
    state.metrics.record_request("/model/classify");
    let classifier = state.pipeline.classifier().current().ok_or_else(not_loaded)?;
    let upload = read_upload(multipart).await?;

    let (probabilities, elapsed_ms) = tokio::task::spawn_blocking({
        let classifier = classifier.clone();
        move || -> ApiResult<_> {
            let image = decode_image(&upload.bytes)?;
            let started = Instant::now();
            let probabilities = classifier.predict(&image)?;
            Ok((probabilities, round_ms(started.elapsed().as_secs_f64() * 1000.0)))
        }
    })
    .await??;

    let labels = classifier.labels();
    if probabilities.len() != labels.len() || probabilities.is_empty() {
        return Err(InferenceError::internal(format!(
            "classifier returned {} scores for {} labels",
            probabilities.len(),
            labels.len()
        ))
        .into());
    }
    let (best, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

    Ok(Json(ClassifyResponse {
        predicted_class: labels[best].clone(),
        confidence: round_to(confidence * 100.0, 2),
        all_probabilities: labels
            .iter()
            .cloned()
            .zip(probabilities.iter().map(|p| round_to(p * 100.0, 2)))
            .collect(),
        inference_time_ms: elapsed_ms,
        model_used: file_name(&state.models.checkpoint_path),
    }))
}

#[instrument(skip(state))]
pub async fn transfer_learning(
    State(state): State<SharedState>,
    Json(request): Json<TransferLearningRequest>,
) -> ApiResult<Json<TransferLearningResponse>> {
    state.metrics.record_request("/model/transfer-learning");
    let arch = BaseArchitecture::from_str(&request.arch)?;
    let classes = state.class_names();
    let checkpoint_path = state.models.checkpoint_path.clone();
    let freeze_base = request.freeze_base;

    let (summary, pretrained_loaded) = tokio::task::spawn_blocking(move || {
        let mut head = arch.build_head(classes.len(), freeze_base, &mut rand::rng());
        let mut loaded = false;
        if arch == BaseArchitecture::Vit && checkpoint_path.exists() {
            match ClassifierCheckpoint::load(&checkpoint_path) {
                Ok(saved) if saved.arch == arch => {
                    let copied = head
                        .copy_compatible_from(&saved.network, &[LayerRole::Backbone, LayerRole::Head]);
                    loaded = copied == head.linear_layers().count();
                }
                Ok(saved) => tracing::debug!("Checkpoint is for {}, not {}", saved.arch, arch),
                Err(e) => tracing::warn!("Could not read checkpoint: {}", e),
            }
        }
        (ArchitectureSummary::new(arch, &head), loaded)
    })
    .await?;

    let classes = state.class_names();
    let arch_name = arch.as_str().to_uppercase();
    let trainable = group_digits(summary.trainable_params);
    let total = group_digits(summary.total_params);
    let message = if pretrained_loaded {
        format!(
            "{} built with pretrained {} weights. Base {}. {} / {} params trainable.",
            arch_name,
            file_name(&state.models.checkpoint_path),
            if freeze_base { "frozen" } else { "unfrozen" },
            trainable,
            total
        )
    } else {
        format!(
            "{} built with ImageNet weights (no local checkpoint). {} / {} params trainable.",
            arch_name, trainable, total
        )
    };

    Ok(Json(TransferLearningResponse {
        architecture: arch_name,
        total_params: summary.total_params,
        trainable_params: summary.trainable_params,
        frozen_params: summary.frozen_params,
        frozen_pct: summary.frozen_pct,
        num_classes: classes.len(),
        classes,
        head_architecture: summary.head_architecture,
        pretrained_weights_loaded: pretrained_loaded,
        message,
    }))
}

#[instrument(skip(state))]
pub async fn retrain(
    State(state): State<SharedState>,
    Query(query): Query<RetrainQuery>,
) -> ApiResult<Json<TrainingState>> {
    state.metrics.record_request("/model/retrain");
    let defaults = TrainingRequest::with_defaults(query.data_dir, &state.training_defaults);
    let request = TrainingRequest {
        epochs: query.epochs.unwrap_or(defaults.epochs),
        batch_size: query.batch_size.unwrap_or(defaults.batch_size),
        learning_rate: query.lr.unwrap_or(defaults.learning_rate),
        unfreeze_epoch: query.unfreeze_epoch.unwrap_or(defaults.unfreeze_epoch),
        val_split: query.val_split.unwrap_or(defaults.val_split),
        seed: query.seed,
        ..defaults
    };

    let training = state.training.clone();
    let started = tokio::task::spawn_blocking(move || training.start(request)).await??;
    Ok(Json(started))
}

#[instrument(skip(state))]
pub async fn train_status(State(state): State<SharedState>) -> Json<TrainingState> {
    Json(state.training.status())
}
