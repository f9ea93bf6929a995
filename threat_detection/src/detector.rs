use crate::{
    detection::{round_to, BoundingBox, RawDetection},
    error::{InferenceError, InferenceResult},
    session_pool::SessionPool,
    settings::ModelSettings,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayD, Axis, Ix4};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &RgbImage) -> InferenceResult<Vec<RawDetection>>;

    fn name(&self) -> &str;
}

/// YOLOv8 detector exported to ONNX (`[1, 4 + classes, anchors]` output).
pub struct OrtDetector {
    pool: SessionPool,
    labels: Vec<String>,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
    name: String,
}

impl OrtDetector {
    pub fn new(settings: &ModelSettings) -> InferenceResult<Self> {
        let detector = &settings.detector;
        let labels = load_labels(&settings.labels_path())?;
        let pool = SessionPool::new(
            &settings.detector_path(),
            settings.num_instances,
            &detector.output_name,
        )?;

        tracing::info!(
            "Loaded detector {} with {} labels",
            detector.onnx_file,
            labels.len()
        );

        Ok(Self {
            pool,
            labels,
            input_size: detector.input_size,
            min_probability: detector.min_probability,
            iou_threshold: detector.iou_threshold,
            name: detector.onnx_file.clone(),
        })
    }
}

impl Detector for OrtDetector {
    fn detect(&self, image: &RgbImage) -> InferenceResult<Vec<RawDetection>> {
        let input = transform_image(image, self.input_size);
        let output = self.pool.run(&input)?;
        decode_output(
            &output,
            image.width(),
            image.height(),
            self.input_size,
            self.min_probability,
            self.iou_threshold,
            &self.labels,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let side = input_size as usize;
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }
    input
}

/// Turns raw YOLO output into labelled boxes in source-image coordinates,
/// dropping low-probability anchors and suppressing overlaps.
pub fn decode_output(
    output: &ArrayD<f32>,
    img_width: u32,
    img_height: u32,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
    labels: &[String],
) -> InferenceResult<Vec<RawDetection>> {
    if output.ndim() != 3 || output.shape()[1] < 5 {
        return Err(InferenceError::internal(format!(
            "unexpected detector output shape {:?}",
            output.shape()
        )));
    }

    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;

    let predictions = output.index_axis(Axis(0), 0);
    let mut candidates: Vec<(usize, f32, BoundingBox)> = Vec::new();

    for anchor in predictions.axis_iter(Axis(1)) {
        let (class_id, prob) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, row| if row.1 > best.1 { row } else { best });

        if prob < min_probability {
            continue;
        }

        let xc = anchor[0] * scale_x;
        let yc = anchor[1] * scale_y;
        let w = anchor[2] * scale_x;
        let h = anchor[3] * scale_y;

        let bbox = BoundingBox::new(xc - w / 2., yc - h / 2., xc + w / 2., yc + h / 2.);
        if !bbox.is_finite() {
            tracing::debug!("Dropping anchor with non-finite box");
            continue;
        }
        candidates.push((class_id, prob, bbox));
    }

    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept: Vec<(usize, f32, BoundingBox)> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|existing| existing.2.iou(&candidate.2) < iou_threshold)
        {
            kept.push(candidate);
        }
    }

    Ok(kept
        .into_iter()
        .map(|(class_id, prob, bbox)| RawDetection {
            label: labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string()),
            confidence: round_to(prob * 100.0, 2),
            bbox,
        })
        .collect())
}

/// Reads one class name per line. Lines may carry trailing `,r,g,b` colour
/// columns, which are ignored.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("No labels found in {}", filepath.display()),
        ));
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;
    use std::io::Write;

    fn labels() -> Vec<String> {
        vec!["person".into(), "airplane".into()]
    }

    fn anchor(output: &mut Array3<f32>, i: usize, bbox: [f32; 4], probs: [f32; 2]) {
        for (k, v) in bbox.iter().chain(probs.iter()).enumerate() {
            output[[0, k, i]] = *v;
        }
    }

    #[test]
    fn transform_image_produces_normalized_nchw_tensor() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));
        let input = transform_image(&img, 64);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-3);
    }

    #[test]
    fn decode_output_scales_boxes_and_maps_labels() {
        let mut output = Array3::<f32>::zeros((1, 6, 3));
        anchor(&mut output, 0, [320.0, 320.0, 64.0, 64.0], [0.1, 0.9]);
        anchor(&mut output, 1, [100.0, 100.0, 10.0, 10.0], [0.05, 0.1]);
        anchor(&mut output, 2, [500.0, 100.0, 20.0, 20.0], [0.6, 0.2]);

        let detections =
            decode_output(&output.into_dyn(), 1280, 640, 640, 0.25, 0.7, &labels()).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "airplane");
        assert_eq!(detections[0].confidence, 90.0);
        assert_eq!(detections[0].bbox, BoundingBox::new(576.0, 288.0, 704.0, 352.0));
        assert_eq!(detections[1].label, "person");
    }

    #[test]
    fn decode_output_suppresses_overlapping_boxes() {
        let mut output = Array3::<f32>::zeros((1, 6, 2));
        anchor(&mut output, 0, [100.0, 100.0, 50.0, 50.0], [0.8, 0.0]);
        anchor(&mut output, 1, [102.0, 101.0, 50.0, 50.0], [0.7, 0.0]);

        let detections =
            decode_output(&output.into_dyn(), 640, 640, 640, 0.25, 0.7, &labels()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 80.0);
    }

    #[test]
    fn decode_output_labels_unknown_class_ids() {
        let mut output = Array3::<f32>::zeros((1, 7, 1));
        output[[0, 2, 0]] = 10.0;
        output[[0, 3, 0]] = 10.0;
        output[[0, 6, 0]] = 0.9;
        let detections =
            decode_output(&output.into_dyn(), 640, 640, 640, 0.25, 0.7, &labels()).unwrap();
        assert_eq!(detections[0].label, "Unknown");
    }

    #[test]
    fn decode_output_drops_non_finite_boxes() {
        let mut output = Array3::<f32>::zeros((1, 6, 2));
        anchor(&mut output, 0, [f32::NAN, 100.0, 50.0, 50.0], [0.9, 0.0]);
        anchor(&mut output, 1, [200.0, 200.0, 20.0, 20.0], [0.8, 0.0]);

        let detections =
            decode_output(&output.into_dyn(), 640, 640, 640, 0.25, 0.7, &labels()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 80.0);
    }

    #[test]
    fn decode_output_rejects_unexpected_shapes() {
        let output = ndarray::Array2::<f32>::zeros((4, 4)).into_dyn();
        assert!(decode_output(&output, 10, 10, 640, 0.25, 0.7, &labels()).is_err());
    }

    #[test]
    fn load_labels_ignores_colour_columns_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person, 255, 0, 0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "drone").unwrap();
        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["person".to_string(), "drone".to_string()]);
    }
}
