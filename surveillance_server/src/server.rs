use crate::{config::Config, media::VideoJob, routes::api_routes, telemetry::Metrics};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use threat_detection::{
    architecture::DEFAULT_CLASSES, settings::TrainingSettings, ImagePipeline, TrainingController,
};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

/// Static facts about the loaded models.
pub struct ModelContext {
    pub device: String,
    pub checkpoint_path: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub yolo: &'static str,
    pub vit: &'static str,
    pub device: String,
    pub vit_classes: Vec<String>,
}

fn load_state(loaded: bool) -> &'static str {
    if loaded {
        "loaded"
    } else {
        "not loaded"
    }
}

#[derive(Clone)]
pub struct SharedState {
    pub pipeline: ImagePipeline,
    pub training: TrainingController,
    pub training_defaults: TrainingSettings,
    pub video: Option<Arc<VideoJob>>,
    pub models: Arc<ModelContext>,
    pub metrics: Arc<Metrics>,
    pub max_upload_bytes: usize,
}

impl SharedState {
    /// Load state of both models as of this call.
    pub fn model_info(&self) -> ModelInfo {
        let classifier = self.pipeline.classifier().current();
        ModelInfo {
            yolo: load_state(true),
            vit: load_state(classifier.is_some()),
            device: self.models.device.clone(),
            vit_classes: classifier
                .map(|c| c.labels().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Labels of the active classifier, or the default label set.
    pub fn class_names(&self) -> Vec<String> {
        match self.pipeline.classifier().current() {
            Some(classifier) if !classifier.labels().is_empty() => classifier.labels().to_vec(),
            _ => DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = build_router(state).layer(metrics_layer);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
