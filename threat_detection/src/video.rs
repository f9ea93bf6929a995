use crate::{
    detection::{Detection, DetectionStatus},
    error::{InferenceError, InferenceResult},
    pipeline::{AnalyzeOptions, ImagePipeline},
};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeSet;

pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container-reported frame count, when known.
    pub frame_count: Option<u64>,
}

impl VideoInfo {
    /// Reported frame rate, or [`DEFAULT_FPS`] when the container has none.
    pub fn effective_fps(&self) -> f64 {
        if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            DEFAULT_FPS
        }
    }
}

/// Decoded frames in presentation order.
pub trait FrameSource {
    fn info(&self) -> VideoInfo;

    fn next_frame(&mut self) -> InferenceResult<Option<RgbImage>>;
}

/// Encoder receiving output frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> InferenceResult<()>;

    /// Flushes and closes the output; no frames may follow.
    fn finish(&mut self) -> InferenceResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct VideoOptions {
    pub frame_interval: u32,
    pub confidence_threshold: f32,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            frame_interval: 5,
            confidence_threshold: 25.0,
        }
    }
}

impl VideoOptions {
    pub fn validate(&self) -> InferenceResult<()> {
        if !(1..=60).contains(&self.frame_interval) {
            return Err(InferenceError::invalid_input(format!(
                "frameInterval must be between 1 and 60, got {}",
                self.frame_interval
            )));
        }
        if !(0.0..=100.0).contains(&self.confidence_threshold) {
            return Err(InferenceError::invalid_input(format!(
                "confidenceThreshold must be between 0 and 100, got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    pub frame_index: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub total_frames_processed: usize,
    pub total_detections: usize,
    pub unique_objects: Vec<String>,
    pub threats: usize,
    pub verified: usize,
    pub analyzing: usize,
    pub avg_confidence: f64,
    pub peak_detection_frame: u64,
}

/// Running aggregates over sampled frames.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    processed: usize,
    total_detections: usize,
    unique: BTreeSet<String>,
    threats: usize,
    verified: usize,
    analyzing: usize,
    confidence_sum: f64,
    peak_count: usize,
    peak_frame: u64,
}

impl SummaryBuilder {
    pub fn record(&mut self, frame_index: u64, detections: &[Detection]) {
        self.processed += 1;
        self.total_detections += detections.len();
        for detection in detections {
            self.unique.insert(detection.object_name.clone());
            self.confidence_sum += detection.confidence_score as f64;
            match detection.status {
                DetectionStatus::Threat => self.threats += 1,
                DetectionStatus::Verified => self.verified += 1,
                DetectionStatus::Analyzing => self.analyzing += 1,
                DetectionStatus::Unknown => {}
            }
        }
        // strictly greater: earliest frame keeps ties
        if detections.len() > self.peak_count {
            self.peak_count = detections.len();
            self.peak_frame = frame_index;
        }
    }

    pub fn build(self) -> VideoSummary {
        let avg_confidence = if self.total_detections == 0 {
            0.0
        } else {
            (self.confidence_sum / self.total_detections as f64 * 100.0).round() / 100.0
        };
        VideoSummary {
            total_frames_processed: self.processed,
            total_detections: self.total_detections,
            unique_objects: self.unique.into_iter().collect(),
            threats: self.threats,
            verified: self.verified,
            analyzing: self.analyzing,
            avg_confidence,
            peak_detection_frame: self.peak_frame,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoReport {
    pub info: VideoInfo,
    pub fps: f64,
    /// Frames actually decoded from the source.
    pub total_frames: u64,
    pub frames: Vec<FrameRecord>,
    pub summary: VideoSummary,
    /// First processed frame, annotated.
    pub thumbnail: Option<RgbImage>,
}

/// Runs the image pipeline over every `frame_interval`-th frame and writes
/// an annotated copy of the stream, repeating the latest annotated frame in
/// between samples.
pub struct VideoPipeline {
    images: ImagePipeline,
}

impl VideoPipeline {
    pub fn new(images: ImagePipeline) -> Self {
        Self { images }
    }

    #[tracing::instrument(skip_all, fields(interval = options.frame_interval))]
    pub fn process(
        &self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        options: VideoOptions,
    ) -> InferenceResult<VideoReport> {
        options.validate()?;
        let info = source.info();
        let fps = info.effective_fps();
        let interval = options.frame_interval as u64;
        let analyze_options = AnalyzeOptions {
            annotate: true,
            keep_crops: false,
        };

        let mut summary = SummaryBuilder::default();
        let mut frames = Vec::new();
        let mut thumbnail: Option<RgbImage> = None;
        let mut last_annotated: Option<RgbImage> = None;
        let mut index: u64 = 0;

        while let Some(frame) = source.next_frame()? {
            if frame.dimensions() != (info.width, info.height) {
                return Err(InferenceError::media(format!(
                    "frame {} is {}x{}, stream reports {}x{}",
                    index,
                    frame.width(),
                    frame.height(),
                    info.width,
                    info.height
                )));
            }
            if index % interval == 0 {
                let analysis = self.images.analyze(&frame, analyze_options)?;
                let detections: Vec<Detection> = analysis
                    .boxes
                    .iter()
                    .map(|b| &b.detection)
                    .filter(|d| d.confidence_score >= options.confidence_threshold)
                    .cloned()
                    .collect();
                let annotated = analysis.annotated.unwrap_or_else(|| frame.clone());

                summary.record(index, &detections);
                frames.push(FrameRecord {
                    frame_index: index,
                    timestamp: (index as f64 / fps * 1000.0).round() / 1000.0,
                    detections,
                });
                if thumbnail.is_none() {
                    thumbnail = Some(annotated.clone());
                }
                sink.write_frame(&annotated)?;
                last_annotated = Some(annotated);
            } else {
                sink.write_frame(last_annotated.as_ref().unwrap_or(&frame))?;
            }
            index += 1;
        }
        sink.finish()?;

        tracing::info!("Processed {} of {} frames", frames.len(), index);

        Ok(VideoReport {
            info,
            fps,
            total_frames: index,
            frames,
            summary: summary.build(),
            thumbnail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        annotate::Annotator,
        classifier::ClassifierSlot,
        detection::{BoundingBox, RawDetection},
        detector::Detector,
        settings::StatusPolicy,
    };
    use image::Rgb;
    use std::sync::Arc;

    struct FixedDetector(Vec<RawDetection>);

    impl Detector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> InferenceResult<Vec<RawDetection>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct SolidFrames {
        remaining: std::ops::Range<u8>,
        fps: f64,
    }

    impl FrameSource for SolidFrames {
        fn info(&self) -> VideoInfo {
            VideoInfo {
                fps: self.fps,
                width: 20,
                height: 20,
                frame_count: None,
            }
        }

        fn next_frame(&mut self) -> InferenceResult<Option<RgbImage>> {
            Ok(self
                .remaining
                .next()
                .map(|i| RgbImage::from_pixel(20, 20, Rgb([0, i * 10, 0]))))
        }
    }

    #[derive(Default)]
    struct Collect {
        frames: Vec<RgbImage>,
        finished: bool,
    }

    impl FrameSink for Collect {
        fn write_frame(&mut self, frame: &RgbImage) -> InferenceResult<()> {
            assert!(!self.finished);
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> InferenceResult<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn video_pipeline(detections: Vec<RawDetection>) -> VideoPipeline {
        VideoPipeline::new(ImagePipeline::new(
            Arc::new(FixedDetector(detections)),
            ClassifierSlot::default(),
            StatusPolicy::default(),
            Arc::new(Annotator::boxes_only()),
        ))
    }

    fn raw(label: &str, confidence: f32) -> RawDetection {
        RawDetection {
            label: label.into(),
            confidence,
            bbox: BoundingBox::new(2.0, 2.0, 8.0, 8.0),
        }
    }

    fn detection(name: &str, status: DetectionStatus, confidence: f32) -> Detection {
        Detection {
            id: "x".into(),
            object_name: name.into(),
            status,
            time_detected: "00:00:00".into(),
            confidence_score: confidence,
            bbox: BoundingBox::default(),
            vit_label: None,
            vit_confidence: None,
        }
    }

    #[test]
    fn samples_every_interval_and_repeats_last_annotated_frame() {
        let pipeline = video_pipeline(vec![raw("drone", 90.0)]);
        let mut source = SolidFrames {
            remaining: 0..12,
            fps: 10.0,
        };
        let mut sink = Collect::default();

        let report = pipeline
            .process(&mut source, &mut sink, VideoOptions::default())
            .unwrap();

        let indices: Vec<u64> = report.frames.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![0, 5, 10]);
        assert_eq!(report.frames[1].timestamp, 0.5);
        assert_eq!(report.total_frames, 12);
        assert!(sink.finished);
        assert_eq!(sink.frames.len(), 12);

        for (i, frame) in sink.frames.iter().enumerate() {
            let sampled = (i / 5 * 5) as u8;
            assert_eq!(frame.get_pixel(15, 15), &Rgb([0, sampled * 10, 0]), "frame {i}");
            assert_eq!(frame.get_pixel(2, 2), &Rgb([255, 0, 0]), "frame {i}");
        }

        let thumbnail = report.thumbnail.unwrap();
        assert_eq!(thumbnail.get_pixel(15, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn threshold_filters_records_but_not_annotation() {
        let pipeline = video_pipeline(vec![raw("drone", 90.0), raw("bird", 20.0)]);
        let mut source = SolidFrames {
            remaining: 0..1,
            fps: 0.0,
        };
        let mut sink = Collect::default();
        let report = pipeline
            .process(&mut source, &mut sink, VideoOptions::default())
            .unwrap();

        assert_eq!(report.fps, DEFAULT_FPS);
        assert_eq!(report.frames[0].detections.len(), 1);
        assert_eq!(report.summary.total_detections, 1);
        assert_eq!(report.summary.unique_objects, vec!["drone".to_string()]);
        assert_eq!(report.summary.threats, 1);
    }

    #[test]
    fn empty_stream_yields_empty_report() {
        let pipeline = video_pipeline(vec![]);
        let mut source = SolidFrames {
            remaining: 0..0,
            fps: 25.0,
        };
        let mut sink = Collect::default();
        let report = pipeline
            .process(&mut source, &mut sink, VideoOptions::default())
            .unwrap();
        assert_eq!(report.total_frames, 0);
        assert!(report.thumbnail.is_none());
        assert_eq!(report.summary, VideoSummary::default());
        assert!(sink.finished);
    }

    struct RotatedFrames {
        remaining: u32,
    }

    impl FrameSource for RotatedFrames {
        fn info(&self) -> VideoInfo {
            VideoInfo {
                fps: 30.0,
                width: 32,
                height: 18,
                frame_count: None,
            }
        }

        fn next_frame(&mut self) -> InferenceResult<Option<RgbImage>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(RgbImage::new(18, 32)))
        }
    }

    #[test]
    fn frames_not_matching_stream_size_are_rejected() {
        let mut source = RotatedFrames { remaining: 3 };
        let mut sink = Collect::default();
        let err = video_pipeline(vec![])
            .process(&mut source, &mut sink, VideoOptions::default())
            .unwrap_err();
        assert!(matches!(err, InferenceError::Media(_)));
        assert!(sink.frames.is_empty());
        assert!(!sink.finished);
    }

    #[test]
    fn invalid_options_are_rejected() {
        for options in [
            VideoOptions {
                frame_interval: 0,
                confidence_threshold: 25.0,
            },
            VideoOptions {
                frame_interval: 61,
                confidence_threshold: 25.0,
            },
            VideoOptions {
                frame_interval: 5,
                confidence_threshold: 100.5,
            },
        ] {
            assert!(matches!(options.validate(), Err(InferenceError::InvalidInput(_))));
        }
    }

    #[test]
    fn peak_frame_ties_keep_first_occurrence() {
        let three = vec![detection("tank", DetectionStatus::Verified, 90.0); 3];
        let mut builder = SummaryBuilder::default();
        builder.record(0, &three);
        builder.record(5, &three);
        builder.record(10, &three[..2]);
        assert_eq!(builder.build().peak_detection_frame, 0);
    }

    #[test]
    fn summary_aggregates_counts_and_average() {
        let mut builder = SummaryBuilder::default();
        builder.record(0, &[]);
        builder.record(
            5,
            &[
                detection("tank", DetectionStatus::Verified, 90.0),
                detection("drone", DetectionStatus::Threat, 85.0),
            ],
        );
        builder.record(10, &[detection("tank", DetectionStatus::Analyzing, 50.5)]);
        let summary = builder.build();

        assert_eq!(summary.total_frames_processed, 3);
        assert_eq!(summary.total_detections, 3);
        assert_eq!(summary.unique_objects, vec!["drone".to_string(), "tank".to_string()]);
        assert_eq!((summary.threats, summary.verified, summary.analyzing), (1, 1, 1));
        assert_eq!(summary.avg_confidence, 75.17);
        assert_eq!(summary.peak_detection_frame, 5);
    }
}
