use crate::network::{HeadNetwork, Layer, LinearGrad};
use ndarray::{Array1, Array2, Zip};
use std::f64::consts::PI;

struct Moments {
    weight_m: Array2<f32>,
    weight_v: Array2<f32>,
    bias_m: Array1<f32>,
    bias_v: Array1<f32>,
}

/// AdamW over the layers that were trainable when it was built.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: i32,
    moments: Vec<Option<Moments>>,
}

impl AdamW {
    pub fn new(network: &HeadNetwork, lr: f32, weight_decay: f32) -> Self {
        let moments = network
            .layers
            .iter()
            .map(|layer| match layer {
                Layer::Linear(linear) if linear.trainable => Some(Moments {
                    weight_m: Array2::zeros(linear.weight.raw_dim()),
                    weight_v: Array2::zeros(linear.weight.raw_dim()),
                    bias_m: Array1::zeros(linear.bias.raw_dim()),
                    bias_v: Array1::zeros(linear.bias.raw_dim()),
                }),
                _ => None,
            })
            .collect();

        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            step: 0,
            moments,
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn step(&mut self, network: &mut HeadNetwork, grads: &[Option<LinearGrad>]) {
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step);
        let bc2 = 1.0 - self.beta2.powi(self.step);
        let (lr, beta1, beta2, eps, wd) =
            (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);

        for ((layer, grad), moments) in network
            .layers
            .iter_mut()
            .zip(grads)
            .zip(self.moments.iter_mut())
        {
            let (Layer::Linear(linear), Some(grad), Some(m)) = (layer, grad, moments) else {
                continue;
            };

            let update = |p: &mut f32, g: &f32, m: &mut f32, v: &mut f32| {
                *p -= lr * wd * *p;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            };

            Zip::from(&mut linear.weight)
                .and(&grad.weight)
                .and(&mut m.weight_m)
                .and(&mut m.weight_v)
                .for_each(update);
            Zip::from(&mut linear.bias)
                .and(&grad.bias)
                .and(&mut m.bias_m)
                .and(&mut m.bias_v)
                .for_each(update);
        }
    }
}

/// Cosine annealing from `base_lr` to zero over `t_max` epochs.
pub struct CosineSchedule {
    base_lr: f32,
    t_max: u32,
    epoch: u32,
}

impl CosineSchedule {
    pub fn new(base_lr: f32, t_max: u32) -> Self {
        Self {
            base_lr,
            t_max: t_max.max(1),
            epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: u32) -> f32 {
        let progress = epoch.min(self.t_max) as f64 / self.t_max as f64;
        (self.base_lr as f64 * (1.0 + (PI * progress).cos()) / 2.0) as f32
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f32 {
        self.epoch += 1;
        self.lr_at(self.epoch)
    }
}
