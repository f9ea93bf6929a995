use opentelemetry::{
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use threat_detection::pipeline::StageTimings;

pub struct Metrics {
    request_counter: Counter<u64>,
    stage_duration: Histogram<f64>,
    video_frames: Counter<u64>,
    training_epoch: Gauge<u64>,
    provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("surveillance_server");

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let boundaries = generate_boundaries((5, 25, 45, 505, 2005));

        let stage_duration = meter
            .f64_histogram("stage_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of pipeline stages in milliseconds")
            .build();

        let video_frames = meter
            .u64_counter("video_frames_processed")
            .with_description("Video frames decoded by the video pipeline")
            .build();

        let training_epoch = meter
            .u64_gauge("training_epoch")
            .with_description("Last completed epoch of the current training run")
            .build();

        Ok(Metrics {
            request_counter,
            stage_duration,
            video_frames,
            training_epoch,
            provider,
            registry,
        })
    }

    /// Handle for installing this provider as the process-wide default.
    pub fn provider(&self) -> SdkMeterProvider {
        self.provider.clone()
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_stage_timings(&self, timings: &StageTimings, route: &str) {
        for (stage, value) in [
            ("detector", timings.detector_ms),
            ("classifier", timings.classifier_ms),
            ("total", timings.total_ms),
        ] {
            let attributes = [
                KeyValue::new("route", route.to_string()),
                KeyValue::new("stage", stage),
            ];
            self.stage_duration.record(value, &attributes);
        }
    }

    pub fn record_video_frames(&self, frames: u64) {
        self.video_frames.add(frames, &[]);
    }

    pub fn record_training_epoch(&self, epoch: u32) {
        self.training_epoch.record(epoch as u64, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 2;
    let middle_step: usize = 5;
    let end_step: usize = 50;
    let tail_step: usize = 500;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
