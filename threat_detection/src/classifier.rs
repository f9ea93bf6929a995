use crate::{
    architecture::{ArchitectureSummary, BaseArchitecture},
    checkpoint::ClassifierCheckpoint,
    detection::{round_to, Classification},
    error::{InferenceError, InferenceResult},
    network::{argmax, HeadNetwork},
    session_pool::SessionPool,
    settings::ModelSettings,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Array1, ArrayView1, Axis, Ix4};
use parking_lot::RwLock;
use std::{path::Path, sync::Arc};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Maps an image to a fixed-width embedding.
pub trait FeatureExtractor: Send + Sync + 'static {
    fn extract(&self, image: &RgbImage) -> InferenceResult<Array1<f32>>;

    fn feature_dim(&self) -> usize;
}

/// Frozen backbone exported to ONNX. Accepts `[1, D]` pooled outputs or
/// `[1, tokens, D]` sequence outputs, in which case the class token is used.
pub struct OrtFeatureExtractor {
    pool: SessionPool,
    input_size: u32,
    feature_dim: usize,
}

impl OrtFeatureExtractor {
    pub fn new(settings: &ModelSettings, arch: BaseArchitecture) -> InferenceResult<Self> {
        let path = settings.backbone_path();
        if !path.exists() {
            return Err(InferenceError::unavailable(format!(
                "backbone not found: {}",
                path.display()
            )));
        }
        let pool = SessionPool::new(
            &path,
            settings.num_instances,
            &settings.classifier.output_name,
        )?;
        Ok(Self {
            pool,
            input_size: settings.classifier.input_size,
            feature_dim: arch.feature_dim(),
        })
    }
}

impl FeatureExtractor for OrtFeatureExtractor {
    fn extract(&self, image: &RgbImage) -> InferenceResult<Array1<f32>> {
        let input = normalize_image(image, self.input_size);
        let output = self.pool.run(&input)?;

        let embedding = match output.ndim() {
            2 => output.index_axis(Axis(0), 0).to_owned(),
            3 => output
                .index_axis(Axis(0), 0)
                .index_axis(Axis(0), 0)
                .to_owned(),
            _ => {
                return Err(InferenceError::internal(format!(
                    "unexpected backbone output shape {:?}",
                    output.shape()
                )))
            }
        };

        if embedding.len() < self.feature_dim {
            return Err(InferenceError::internal(format!(
                "backbone produced {} features, expected {}",
                embedding.len(),
                self.feature_dim
            )));
        }
        Ok(embedding
            .iter()
            .take(self.feature_dim)
            .copied()
            .collect::<Array1<f32>>())
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

fn normalize_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let side = input_size as usize;
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::Triangle);

    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            input[[0, c, y, x]] = (pixel.0[c] as f32 / 255. - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    input
}

pub trait Classifier: Send + Sync + 'static {
    fn labels(&self) -> &[String];

    /// Probability per label, in label order.
    fn predict(&self, image: &RgbImage) -> InferenceResult<Vec<f32>>;

    fn classify(&self, image: &RgbImage) -> InferenceResult<Classification> {
        let probs = self.predict(image)?;
        let labels = self.labels();
        if probs.len() != labels.len() || probs.is_empty() {
            return Err(InferenceError::internal(format!(
                "classifier returned {} scores for {} labels",
                probs.len(),
                labels.len()
            )));
        }
        let best = argmax(ArrayView1::from(&probs[..]));
        Ok(Classification {
            label: labels[best].clone(),
            confidence: round_to(probs[best] * 100.0, 2),
        })
    }

    fn summary(&self) -> Option<ArchitectureSummary> {
        None
    }
}

/// Backbone embedding followed by a trained head. Labels and weights are
/// immutable once built; a retrain produces a new instance.
pub struct VitClassifier {
    extractor: Arc<dyn FeatureExtractor>,
    arch: BaseArchitecture,
    classes: Vec<String>,
    network: HeadNetwork,
}

impl VitClassifier {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        checkpoint: ClassifierCheckpoint,
    ) -> InferenceResult<Self> {
        checkpoint.validate()?;
        if checkpoint.network.input_dim() != Some(extractor.feature_dim()) {
            return Err(InferenceError::internal(format!(
                "head expects {:?} features, backbone produces {}",
                checkpoint.network.input_dim(),
                extractor.feature_dim()
            )));
        }
        Ok(Self {
            extractor,
            arch: checkpoint.arch,
            classes: checkpoint.classes,
            network: checkpoint.network,
        })
    }

    pub fn from_file(extractor: Arc<dyn FeatureExtractor>, path: &Path) -> InferenceResult<Self> {
        let checkpoint = ClassifierCheckpoint::load(path)?;
        tracing::info!(
            "Loaded classifier checkpoint {} ({} classes)",
            path.display(),
            checkpoint.classes.len()
        );
        Self::new(extractor, checkpoint)
    }

    pub fn arch(&self) -> BaseArchitecture {
        self.arch
    }

    pub fn network(&self) -> &HeadNetwork {
        &self.network
    }

    pub fn checkpoint(&self) -> ClassifierCheckpoint {
        ClassifierCheckpoint {
            arch: self.arch,
            classes: self.classes.clone(),
            network: self.network.clone(),
        }
    }
}

impl Classifier for VitClassifier {
    fn labels(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, image: &RgbImage) -> InferenceResult<Vec<f32>> {
        let features = self.extractor.extract(image)?;
        Ok(self.network.probabilities(features.view()).to_vec())
    }

    fn summary(&self) -> Option<ArchitectureSummary> {
        Some(ArchitectureSummary::new(self.arch, &self.network))
    }
}

/// Shared handle to the production classifier. Readers take an `Arc`
/// snapshot; a retrain replaces the whole snapshot at once.
#[derive(Clone, Default)]
pub struct ClassifierSlot {
    inner: Arc<RwLock<Option<Arc<dyn Classifier>>>>,
}

impl ClassifierSlot {
    pub fn new(classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(classifier)),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn Classifier>> {
        self.inner.read().clone()
    }

    /// Installs `classifier` and returns the previous one.
    pub fn swap(&self, classifier: Arc<dyn Classifier>) -> Option<Arc<dyn Classifier>> {
        let previous = self.inner.write().replace(classifier);
        tracing::info!("Classifier swapped");
        previous
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Layer, LayerRole, Linear};
    use image::Rgb;
    use ndarray::array;
    use std::thread;

    /// Embedding = mean channel values.
    struct MeanColor;

    impl FeatureExtractor for MeanColor {
        fn extract(&self, image: &RgbImage) -> InferenceResult<Array1<f32>> {
            let n = (image.width() * image.height()).max(1) as f32;
            let mut sums = [0f32; 3];
            for pixel in image.pixels() {
                for c in 0..3 {
                    sums[c] += pixel.0[c] as f32 / 255.0;
                }
            }
            Ok(sums.iter().map(|s| s / n).collect())
        }

        fn feature_dim(&self) -> usize {
            3
        }
    }

    struct Fixed {
        labels: Vec<String>,
    }

    impl Classifier for Fixed {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn predict(&self, _image: &RgbImage) -> InferenceResult<Vec<f32>> {
            let n = self.labels.len() as f32;
            Ok(vec![1.0 / n; self.labels.len()])
        }
    }

    fn red_vs_blue() -> ClassifierCheckpoint {
        let head = Linear {
            name: "heads.head".into(),
            role: LayerRole::Head,
            weight: array![[10.0, 0.0, 0.0], [0.0, 0.0, 10.0]],
            bias: Array1::zeros(2),
            trainable: true,
        };
        ClassifierCheckpoint {
            arch: BaseArchitecture::Vit,
            classes: vec!["red".into(), "blue".into()],
            network: HeadNetwork::new(vec![Layer::Linear(head)]),
        }
    }

    #[test]
    fn normalize_image_applies_imagenet_statistics() {
        let img = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        let input = normalize_image(&img, 4);
        assert_eq!(input.shape(), &[1, 3, 4, 4]);
        assert!((input[[0, 0, 0, 0]] - (1.0 - 0.485) / 0.229).abs() < 1e-4);
    }

    #[test]
    fn head_classifies_by_embedding() {
        let checkpoint = red_vs_blue();
        let classifier = VitClassifier {
            extractor: Arc::new(MeanColor),
            arch: checkpoint.arch,
            classes: checkpoint.classes,
            network: checkpoint.network,
        };

        let red = classifier
            .classify(&RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])))
            .unwrap();
        assert_eq!(red.label, "red");
        assert!(red.confidence > 99.0);

        let blue = classifier
            .classify(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 255])))
            .unwrap();
        assert_eq!(blue.label, "blue");
    }

    #[test]
    fn new_rejects_feature_width_mismatch() {
        let mut rng = rand::rng();
        let checkpoint = ClassifierCheckpoint {
            arch: BaseArchitecture::Vit,
            classes: vec!["a".into(), "b".into()],
            network: BaseArchitecture::Vit.build_head(2, true, &mut rng),
        };
        assert!(VitClassifier::new(Arc::new(MeanColor), checkpoint).is_err());
    }

    #[test]
    fn classify_rejects_score_label_mismatch() {
        struct Broken;
        impl Classifier for Broken {
            fn labels(&self) -> &[String] {
                &[]
            }
            fn predict(&self, _image: &RgbImage) -> InferenceResult<Vec<f32>> {
                Ok(vec![1.0])
            }
        }
        assert!(Broken.classify(&RgbImage::new(1, 1)).is_err());
    }

    #[test]
    fn slot_swap_is_seen_whole_by_concurrent_readers() {
        let slot = ClassifierSlot::new(Some(Arc::new(Fixed {
            labels: vec!["a".into(), "b".into()],
        })));
        let image = RgbImage::new(2, 2);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                let image = image.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let classifier = slot.current().unwrap();
                        let probs = classifier.predict(&image).unwrap();
                        assert_eq!(probs.len(), classifier.labels().len());
                        assert!(matches!(classifier.labels().len(), 2 | 5));
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            slot.swap(Arc::new(Fixed {
                labels: (0..5).map(|i| i.to_string()).collect(),
            }));
            slot.swap(Arc::new(Fixed {
                labels: vec!["a".into(), "b".into()],
            }));
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn empty_slot_reports_unloaded() {
        let slot = ClassifierSlot::default();
        assert!(!slot.is_loaded());
        assert!(slot.current().is_none());
        let previous = slot.swap(Arc::new(Fixed {
            labels: vec!["x".into()],
        }));
        assert!(previous.is_none());
        assert!(slot.is_loaded());
    }
}
