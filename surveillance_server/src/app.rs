use crate::{
    config::Config,
    media::{select_backend, Transcoder, VideoJob},
    server::{HttpServer, ModelContext, SharedState},
    telemetry::Metrics,
};
use std::{sync::Arc, time::Duration};
use threat_detection::{
    Annotator, Classifier, ClassifierSlot, FeatureExtractor, ImagePipeline, OrtDetector,
    OrtFeatureExtractor, TrainingController, VitClassifier,
};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config, metrics: Metrics) -> anyhow::Result<()> {
    let metrics = Arc::new(metrics);
    let models = &config.models;
    let arch = models.classifier.arch;

    if let Err(e) = models.validate() {
        tracing::error!("Invalid model configuration: {}", e);
        return Err(anyhow::anyhow!(e));
    }

    let detector = match OrtDetector::new(models) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to load detector: {}", e);
            return Err(e.into());
        }
    };

    let extractor: Option<Arc<dyn FeatureExtractor>> = match OrtFeatureExtractor::new(models, arch)
    {
        Ok(extractor) => Some(Arc::new(extractor)),
        Err(e) => {
            tracing::warn!("Feature backbone unavailable, classifier disabled: {}", e);
            None
        }
    };

    let checkpoint_path = models.checkpoint_path();
    let classifier: Option<Arc<dyn Classifier>> = match &extractor {
        Some(extractor) if checkpoint_path.exists() => {
            match VitClassifier::from_file(extractor.clone(), &checkpoint_path) {
                Ok(classifier) => Some(Arc::new(classifier)),
                Err(e) => {
                    tracing::warn!("Could not load classifier checkpoint: {}", e);
                    None
                }
            }
        }
        Some(_) => {
            tracing::warn!(
                "No classifier checkpoint at {}, running detector only",
                checkpoint_path.display()
            );
            None
        }
        None => None,
    };

    let annotator = Annotator::new(&config.annotation).unwrap_or_else(|e| {
        tracing::warn!("Could not load annotation font, drawing boxes only: {}", e);
        Annotator::boxes_only()
    });

    let slot = ClassifierSlot::new(classifier);
    let pipeline = ImagePipeline::new(
        detector,
        slot.clone(),
        config.status.clone(),
        Arc::new(annotator),
    );
    let epoch_metrics = metrics.clone();
    let training = TrainingController::new(extractor, slot, arch, checkpoint_path.clone())
        .on_epoch(move |epoch| epoch_metrics.record_training_epoch(epoch));

    let video = match select_backend(config.video.backend) {
        Ok(backend) => {
            let transcoder = Transcoder::detect(Duration::from_secs(
                config.video.transcode_timeout_secs,
            ));
            tracing::info!("Video backend: {}", backend.name());
            Some(Arc::new(VideoJob::new(
                backend,
                Arc::new(transcoder),
                config.video.temp_dir.clone(),
            )))
        }
        Err(e) => {
            tracing::warn!("Video processing disabled: {}", e);
            None
        }
    };

    let state = SharedState {
        pipeline,
        training,
        training_defaults: config.training.clone(),
        video,
        models: Arc::new(ModelContext {
            device: models.device.clone(),
            checkpoint_path,
        }),
        metrics,
        max_upload_bytes: config.video.max_upload_bytes(),
    };

    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
