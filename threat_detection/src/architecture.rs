use crate::{
    error::InferenceError,
    network::{HeadNetwork, Layer, LayerRole, Linear},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Pretrained backbones a classification head can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseArchitecture {
    #[default]
    Vit,
    Resnet50,
    EfficientNet,
}

impl BaseArchitecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseArchitecture::Vit => "vit",
            BaseArchitecture::Resnet50 => "resnet50",
            BaseArchitecture::EfficientNet => "efficientnet",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BaseArchitecture::Vit => "ViT-B/16 (vit_b_16)",
            BaseArchitecture::Resnet50 => "ResNet-50",
            BaseArchitecture::EfficientNet => "EfficientNet-B0",
        }
    }

    /// Width of the embedding produced by the backbone.
    pub fn feature_dim(&self) -> usize {
        match self {
            BaseArchitecture::Vit => 768,
            BaseArchitecture::Resnet50 => 2048,
            BaseArchitecture::EfficientNet => 1280,
        }
    }

    /// Parameter count of the ONNX backbone, which is not inspectable at runtime.
    pub fn backbone_params(&self) -> usize {
        match self {
            BaseArchitecture::Vit => 85_798_656,
            BaseArchitecture::Resnet50 => 23_508_032,
            BaseArchitecture::EfficientNet => 4_007_548,
        }
    }

    /// Builds an untrained head with `num_classes` outputs. The leading
    /// adapter starts as the identity and is frozen when `freeze_base`.
    pub fn build_head<R: Rng + ?Sized>(
        &self,
        num_classes: usize,
        freeze_base: bool,
        rng: &mut R,
    ) -> HeadNetwork {
        let dim = self.feature_dim();
        let mut adapter = Linear::identity("encoder.adapter", LayerRole::Backbone, dim);
        adapter.trainable = !freeze_base;

        let layers = match self {
            BaseArchitecture::Vit => vec![
                Layer::Linear(adapter),
                Layer::Linear(Linear::random(
                    "heads.head",
                    LayerRole::Head,
                    dim,
                    num_classes,
                    rng,
                )),
            ],
            BaseArchitecture::Resnet50 | BaseArchitecture::EfficientNet => vec![
                Layer::Linear(adapter),
                Layer::Dropout { p: 0.3 },
                Layer::Linear(Linear::random("fc.1", LayerRole::Head, dim, 512, rng)),
                Layer::Relu,
                Layer::Dropout { p: 0.2 },
                Layer::Linear(Linear::random("fc.4", LayerRole::Head, 512, num_classes, rng)),
            ],
        };

        HeadNetwork::new(layers)
    }
}

impl fmt::Display for BaseArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseArchitecture {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vit" | "vit_b_16" => Ok(BaseArchitecture::Vit),
            "resnet50" | "resnet" => Ok(BaseArchitecture::Resnet50),
            "efficientnet" | "efficientnet_b0" => Ok(BaseArchitecture::EfficientNet),
            other => Err(InferenceError::invalid_input(format!(
                "Unknown architecture: {}. Choose from: vit, resnet50, efficientnet",
                other
            ))),
        }
    }
}

/// Fallback label set used when no classifier is loaded.
pub const DEFAULT_CLASSES: [&str; 10] = [
    "aircraft",
    "artelary",
    "camo_soldier",
    "civilian_vehical",
    "mil_truck",
    "mil_vehical",
    "soldier",
    "tank",
    "warship",
    "weapons",
];

/// One row of the per-parameter listing.
#[derive(Debug, Clone, Serialize)]
pub struct LayerInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub shape: Vec<usize>,
    pub parameters: usize,
    pub trainable: bool,
}

/// Parameter accounting for a backbone plus head.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureSummary {
    pub architecture: String,
    pub total_params: usize,
    pub trainable_params: usize,
    pub frozen_params: usize,
    pub frozen_pct: f64,
    pub trainable_pct: f64,
    pub head_architecture: String,
    pub layers: Vec<LayerInfo>,
}

impl ArchitectureSummary {
    /// The backbone always counts as frozen; head layers count according to
    /// their own flag.
    pub fn new(arch: BaseArchitecture, head: &HeadNetwork) -> Self {
        let (head_total, head_trainable) = head.param_counts();
        let total_params = arch.backbone_params() + head_total;
        let trainable_params = head_trainable;
        let frozen_params = total_params - trainable_params;
        let pct = |n: usize| {
            if total_params == 0 {
                0.0
            } else {
                (n as f64 / total_params as f64 * 10_000.0).round() / 100.0
            }
        };

        let layers = head
            .linear_layers()
            .flat_map(|linear| {
                let kind = linear.name.split('.').next().unwrap_or_default().to_string();
                [
                    LayerInfo {
                        name: format!("{}.weight", linear.name),
                        kind: kind.clone(),
                        shape: linear.weight.shape().to_vec(),
                        parameters: linear.weight.len(),
                        trainable: linear.trainable,
                    },
                    LayerInfo {
                        name: format!("{}.bias", linear.name),
                        kind,
                        shape: vec![linear.bias.len()],
                        parameters: linear.bias.len(),
                        trainable: linear.trainable,
                    },
                ]
            })
            .collect();

        Self {
            architecture: arch.display_name().to_string(),
            total_params,
            trainable_params,
            frozen_params,
            frozen_pct: pct(frozen_params),
            trainable_pct: pct(trainable_params),
            head_architecture: head.to_string(),
            layers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn parses_known_architectures() {
        assert_eq!("ViT".parse::<BaseArchitecture>().unwrap(), BaseArchitecture::Vit);
        assert_eq!(
            "resnet50".parse::<BaseArchitecture>().unwrap(),
            BaseArchitecture::Resnet50
        );
        assert!(matches!(
            "alexnet".parse::<BaseArchitecture>(),
            Err(InferenceError::InvalidInput(_))
        ));
    }

    #[test]
    fn vit_head_has_adapter_and_linear_output() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = BaseArchitecture::Vit.build_head(4, true, &mut rng);
        assert_eq!(head.input_dim(), Some(768));
        assert_eq!(head.output_dim(), Some(4));
        let (total, trainable) = head.param_counts();
        assert_eq!(total, 768 * 768 + 768 + 768 * 4 + 4);
        assert_eq!(trainable, 768 * 4 + 4);
    }

    #[test]
    fn resnet_head_stacks_hidden_layer() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = BaseArchitecture::Resnet50.build_head(3, false, &mut rng);
        assert_eq!(head.layers.len(), 6);
        assert_eq!(head.input_dim(), Some(2048));
        assert_eq!(head.output_dim(), Some(3));
        assert!(!head.has_frozen_layers());
    }

    #[test]
    fn summary_counts_backbone_as_frozen() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = BaseArchitecture::EfficientNet.build_head(2, true, &mut rng);
        let summary = ArchitectureSummary::new(BaseArchitecture::EfficientNet, &head);
        let (head_total, head_trainable) = head.param_counts();
        assert_eq!(summary.total_params, 4_007_548 + head_total);
        assert_eq!(summary.trainable_params, head_trainable);
        assert_eq!(summary.frozen_params + summary.trainable_params, summary.total_params);
        assert_eq!(summary.layers.len(), 6);
        assert!(summary.layers[0].name.starts_with("encoder.adapter"));
        assert!(!summary.layers[0].trainable);
    }
}
