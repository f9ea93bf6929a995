//! Small dense network that sits on top of the frozen feature extractor.
//!
//! Layers are applied in order. Linear layers tagged [`LayerRole::Backbone`]
//! form the adapter that is frozen during warm-up; [`LayerRole::Head`] layers
//! are always trained.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    Backbone,
    Head,
}

fn trainable_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub name: String,
    pub role: LayerRole,
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    #[serde(skip, default = "trainable_by_default")]
    pub trainable: bool,
}

impl Linear {
    pub fn random<R: Rng + ?Sized>(
        name: &str,
        role: LayerRole,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight =
            Array2::from_shape_fn((out_features, in_features), |_| rng.random_range(-bound..bound));
        let bias = Array1::from_shape_fn(out_features, |_| rng.random_range(-bound..bound));
        Self {
            name: name.to_string(),
            role,
            weight,
            bias,
            trainable: true,
        }
    }

    pub fn identity(name: &str, role: LayerRole, features: usize) -> Self {
        Self {
            name: name.to_string(),
            role,
            weight: Array2::eye(features),
            bias: Array1::zeros(features),
            trainable: true,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    fn apply(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weight.t());
        out += &self.bias;
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Layer {
    Linear(Linear),
    Relu,
    Dropout { p: f32 },
}

/// Gradients for one linear layer.
#[derive(Debug, Clone)]
pub struct LinearGrad {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Intermediate values kept by [`HeadNetwork::forward_train`] for the backward pass.
pub struct ForwardCache {
    entries: Vec<Array2<f32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadNetwork {
    pub layers: Vec<Layer>,
}

impl HeadNetwork {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn linear_layers(&self) -> impl Iterator<Item = &Linear> {
        self.layers.iter().filter_map(|layer| match layer {
            Layer::Linear(linear) => Some(linear),
            _ => None,
        })
    }

    pub fn linear_layers_mut(&mut self) -> impl Iterator<Item = &mut Linear> {
        self.layers.iter_mut().filter_map(|layer| match layer {
            Layer::Linear(linear) => Some(linear),
            _ => None,
        })
    }

    pub fn input_dim(&self) -> Option<usize> {
        self.linear_layers().next().map(Linear::in_features)
    }

    pub fn output_dim(&self) -> Option<usize> {
        self.linear_layers().last().map(Linear::out_features)
    }

    /// `(total, trainable)` parameter counts.
    pub fn param_counts(&self) -> (usize, usize) {
        self.linear_layers().fold((0, 0), |(total, trainable), linear| {
            let n = linear.num_params();
            (total + n, trainable + if linear.trainable { n } else { 0 })
        })
    }

    pub fn set_role_trainable(&mut self, role: LayerRole, trainable: bool) {
        for linear in self.linear_layers_mut().filter(|l| l.role == role) {
            linear.trainable = trainable;
        }
    }

    pub fn unfreeze_all(&mut self) {
        for linear in self.linear_layers_mut() {
            linear.trainable = true;
        }
    }

    pub fn has_frozen_layers(&self) -> bool {
        self.linear_layers().any(|l| !l.trainable)
    }

    /// Inference pass; dropout is the identity.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut current = x.to_owned();
        for layer in &self.layers {
            current = match layer {
                Layer::Linear(linear) => linear.apply(&current.view()),
                Layer::Relu => current.mapv(|v| v.max(0.0)),
                Layer::Dropout { .. } => current,
            };
        }
        current
    }

    pub fn probabilities(&self, features: ArrayView1<f32>) -> Array1<f32> {
        let input = features.insert_axis(Axis(0));
        let logits = self.forward(input);
        softmax(&logits).row(0).to_owned()
    }

    /// Training pass with dropout active. Returns logits and the cache
    /// required by [`HeadNetwork::backward`].
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: ArrayView2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, ForwardCache) {
        let mut entries = Vec::with_capacity(self.layers.len());
        let mut current = x.to_owned();
        for layer in &self.layers {
            current = match layer {
                Layer::Linear(linear) => {
                    let out = linear.apply(&current.view());
                    entries.push(current);
                    out
                }
                Layer::Relu => {
                    let mask = current.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                    let out = &current * &mask;
                    entries.push(mask);
                    out
                }
                Layer::Dropout { p } => {
                    let keep = 1.0 - p.clamp(0.0, 0.99);
                    let mask = current.mapv(|_| {
                        if rng.random::<f32>() < keep {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    });
                    let out = &current * &mask;
                    entries.push(mask);
                    out
                }
            };
        }
        (current, ForwardCache { entries })
    }

    /// Back-propagates `grad` (dL/dlogits). The result is indexed like
    /// `self.layers`; only trainable linear layers get gradients.
    pub fn backward(&self, cache: &ForwardCache, grad: Array2<f32>) -> Vec<Option<LinearGrad>> {
        let mut grads = vec![None; self.layers.len()];
        let mut current = grad;
        for (index, layer) in self.layers.iter().enumerate().rev() {
            let cached = &cache.entries[index];
            current = match layer {
                Layer::Linear(linear) => {
                    if linear.trainable {
                        grads[index] = Some(LinearGrad {
                            weight: current.t().dot(cached),
                            bias: current.sum_axis(Axis(0)),
                        });
                    }
                    if index == 0 {
                        break;
                    }
                    current.dot(&linear.weight)
                }
                Layer::Relu | Layer::Dropout { .. } => &current * cached,
            };
        }
        grads
    }

    /// Copies weights from `other` for every linear layer with the same name
    /// and shape. Returns the number of layers copied.
    pub fn copy_compatible_from(&mut self, other: &HeadNetwork, roles: &[LayerRole]) -> usize {
        let mut copied = 0;
        for linear in self.linear_layers_mut() {
            if !roles.contains(&linear.role) {
                continue;
            }
            let source = other.linear_layers().find(|candidate| {
                candidate.name == linear.name
                    && candidate.weight.dim() == linear.weight.dim()
                    && candidate.bias.len() == linear.bias.len()
            });
            if let Some(source) = source {
                linear.weight.assign(&source.weight);
                linear.bias.assign(&source.bias);
                copied += 1;
            }
        }
        copied
    }
}

impl fmt::Display for HeadNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential(")?;
        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                Layer::Linear(linear) => writeln!(
                    f,
                    "  ({}): Linear(in_features={}, out_features={}, bias=True) [{}{}]",
                    index,
                    linear.in_features(),
                    linear.out_features(),
                    linear.name,
                    if linear.trainable { "" } else { ", frozen" }
                )?,
                Layer::Relu => writeln!(f, "  ({}): ReLU(inplace=True)", index)?,
                Layer::Dropout { p } => {
                    writeln!(f, "  ({}): Dropout(p={}, inplace=False)", index, p)?
                }
            }
        }
        write!(f, ")")
    }
}

pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Batch statistics of [`smoothed_cross_entropy`].
pub struct LossOutput {
    /// Sum of per-sample losses.
    pub loss_sum: f32,
    pub correct: usize,
    /// Gradient of the mean loss with respect to the logits.
    pub grad: Array2<f32>,
}

/// Cross-entropy against targets smoothed to `(1 - s)` on the true class and
/// `s / K` spread over all classes.
pub fn smoothed_cross_entropy(logits: &Array2<f32>, targets: &[usize], smoothing: f32) -> LossOutput {
    let batch = logits.nrows();
    let classes = logits.ncols();
    let probs = softmax(logits);
    let mut grad = probs.clone();
    let mut loss_sum = 0.0;
    let mut correct = 0;

    for (i, &target) in targets.iter().enumerate() {
        let row = probs.row(i);
        let predicted = argmax(row);
        if predicted == target {
            correct += 1;
        }
        for k in 0..classes {
            let q = smoothing / classes as f32 + if k == target { 1.0 - smoothing } else { 0.0 };
            loss_sum -= q * row[k].max(1e-12).ln();
            grad[[i, k]] -= q;
        }
    }

    grad.mapv_inplace(|v| v / batch.max(1) as f32);
    LossOutput {
        loss_sum,
        correct,
        grad,
    }
}

pub fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
