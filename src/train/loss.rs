use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::ops;
use serde::{Deserialize, Serialize};

use crate::datasets::TopologyClass;

/// How much each class contributes to the training loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ClassWeighting {
    Uniform,
    /// Every class weighs 1.0 except split candidates.
    Conservative { split_weight: f32 },
    /// `n_train / (num_classes * count_c)`; classes absent from training
    /// keep 1.0.
    InverseFrequency,
}
impl Default for ClassWeighting {
    fn default() -> Self {
        Self::Conservative { split_weight: 1.5 }
    }
}
impl ClassWeighting {
    pub fn weights(&self, train_labels: &[u32], num_classes: usize) -> Vec<f32> {
        let mut weights = vec![1.0f32; num_classes];
        match *self {
            Self::Uniform => {}
            Self::Conservative { split_weight } => {
                if let Some(w) = weights.get_mut(TopologyClass::SplitYT.index()) {
                    *w = split_weight;
                }
            }
            Self::InverseFrequency => {
                let mut counts = vec![0usize; num_classes];
                for &label in train_labels {
                    counts[label as usize] += 1;
                }
                let n = train_labels.len() as f32;
                for (w, &count) in weights.iter_mut().zip(&counts) {
                    if count > 0 {
                        *w = n / (num_classes as f32 * count as f32);
                    }
                }
            }
        }
        weights
    }
}

/// Cross-entropy with per-class weights, reduced as
/// `sum(w[y_i] * nll_i) / sum(w[y_i])`.
pub fn weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let nll = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;
    let w = weights.i(targets)?;
    let total = (nll * &w)?.sum_all()?;
    total.div(&w.sum_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_cost_ln_classes() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((4, 3), candle_core::DType::F32, &device).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 2], &device).unwrap();
        let weights = Tensor::new(&[1f32, 2., 5.], &device).unwrap();
        let loss = weighted_cross_entropy(&logits, &targets, &weights)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn weights_shift_the_mean() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 0., 0.], [0., 0., 0.]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();
        let weights = Tensor::new(&[1f32, 3., 1.], &device).unwrap();
        let loss = weighted_cross_entropy(&logits, &targets, &weights)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let nll0 = (2f32.exp() + 2.0).ln() - 2.0;
        let nll1 = 3f32.ln();
        let expected = (nll0 + 3.0 * nll1) / 4.0;
        assert!((loss - expected).abs() < 1e-5, "{loss} != {expected}");
    }

    #[test]
    fn inverse_frequency_weights() {
        let weights = ClassWeighting::InverseFrequency.weights(&[0, 0, 0, 1], 3);
        assert!((weights[0] - 4.0 / 9.0).abs() < 1e-6);
        assert!((weights[1] - 4.0 / 3.0).abs() < 1e-6);
        assert_eq!(weights[2], 1.0);
    }

    #[test]
    fn conservative_weights_only_touch_splits() {
        let weights = ClassWeighting::default().weights(&[0, 1, 2], 3);
        assert_eq!(weights, vec![1.0, 1.0, 1.5]);
        assert_eq!(ClassWeighting::Uniform.weights(&[2], 3), vec![1.0; 3]);
    }
}
