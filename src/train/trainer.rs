use candle_core::backprop::GradStore;
use candle_core::{DType, IndexOp, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use super::early_stopping::EarlyStopping;
use super::loss::{weighted_cross_entropy, ClassWeighting};
use super::scheduler::{PlateauParams, ReduceOnPlateau};
use crate::datasets::{GraphTensors, TopologyClass};
use crate::error::{Error, Result};
use crate::nn::{GnnModule, GraphSage};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Validation runs on epochs divisible by this.
    pub validate_every: usize,
    /// Non-improving validation checks tolerated before stopping.
    pub patience: usize,
    pub max_grad_norm: f64,
    pub class_weighting: ClassWeighting,
    pub plateau: Option<PlateauParams>,
    #[serde(skip)]
    pub show_progress: bool,
}
impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.01,
            weight_decay: 5e-4,
            validate_every: 10,
            patience: 3,
            max_grad_norm: 1.0,
            class_weighting: ClassWeighting::default(),
            plateau: None,
            show_progress: false,
        }
    }
}
impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.validate_every == 0 || self.patience == 0 {
            return Err(Error::Config(
                "epochs, validate_every and patience must be positive".to_owned(),
            ));
        }
        if !(self.learning_rate > 0.0) || !(self.max_grad_norm > 0.0) || self.weight_decay < 0.0 {
            return Err(Error::Config(format!(
                "learning_rate={} max_grad_norm={} weight_decay={} out of range",
                self.learning_rate, self.max_grad_norm, self.weight_decay
            )));
        }
        Ok(())
    }
}

/// One validation checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub loss: f32,
    pub val_accuracy: Option<f32>,
    pub learning_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_val_accuracy: Option<f32>,
    pub final_loss: f32,
    pub final_learning_rate: f64,
    pub class_weights: Vec<f32>,
    pub history: Vec<Checkpoint>,
}

pub struct Trainer {
    config: TrainerConfig,
}
impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Full-batch training on the train partition. Parameters are updated in
    /// place; the model keeps its final-epoch weights.
    pub fn fit(&self, model: &GraphSage, data: &GraphTensors) -> Result<TrainingSummary> {
        if data.num_train == 0 {
            return Err(Error::data_format("training partition is empty"));
        }
        let config = &self.config;
        let device = data.xs.device();

        let train_ys = data.ys.i(&data.train_indices)?;
        let class_weights = config
            .class_weighting
            .weights(&train_ys.to_vec1::<u32>()?, TopologyClass::COUNT);
        let weights = Tensor::from_slice(&class_weights, class_weights.len(), device)?;
        tracing::info!(?class_weights, train = data.num_train, "class weights");

        let vars = model.parameters();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let mut stopping = EarlyStopping::new(config.patience);
        let mut plateau = config.plateau.map(ReduceOnPlateau::new);
        if data.num_val == 0 {
            tracing::warn!("validation partition is empty; early stopping disabled");
        }

        let pbar = progress_bar(config.epochs, config.show_progress);
        let mut history = Vec::new();
        let mut epochs_run = 0;
        let mut final_loss = f32::NAN;
        let mut stopped_early = false;
        for epoch in 0..config.epochs {
            let logits = model.forward_t(&data.xs, &data.edge_index, true)?;
            let train_logits = logits.i(&data.train_indices)?;
            let loss = weighted_cross_entropy(&train_logits, &train_ys, &weights)?;
            let loss_value = loss.to_scalar::<f32>()?;
            if !loss_value.is_finite() {
                pbar.abandon();
                tracing::error!(epoch, loss = loss_value, "training diverged");
                return Err(Error::TrainingDiverged {
                    epoch,
                    loss: loss_value,
                });
            }
            let mut grads = loss.backward()?;
            let grad_norm = clip_grad_norm(&vars, &mut grads, config.max_grad_norm)?;
            optimizer.step(&grads)?;
            epochs_run = epoch + 1;
            final_loss = loss_value;
            pbar.inc(1);

            if epoch % config.validate_every != 0 {
                continue;
            }
            let val_accuracy = if data.num_val > 0 {
                let logits = model.forward_t(&data.xs, &data.edge_index, false)?;
                Some(accuracy(&logits, &data.ys, &data.val_indices)?)
            } else {
                None
            };
            let reduced = plateau
                .as_mut()
                .and_then(|p| p.step(loss_value, optimizer.learning_rate()));
            if let Some(lr) = reduced {
                tracing::info!(epoch, lr, "reducing learning rate");
                optimizer.set_learning_rate(lr);
            }
            pbar.set_message(format!(
                "loss {loss_value:.4} val {}",
                val_accuracy.map_or("-".to_owned(), |a| format!("{:.2}%", 100.0 * a))
            ));
            tracing::debug!(epoch, loss = loss_value, grad_norm, ?val_accuracy, "checkpoint");
            history.push(Checkpoint {
                epoch,
                loss: loss_value,
                val_accuracy,
                learning_rate: optimizer.learning_rate(),
            });
            if let Some(acc) = val_accuracy {
                if stopping.observe(acc) {
                    tracing::info!(epoch, best = ?stopping.best(), "early stopping");
                    stopped_early = true;
                    break;
                }
            }
        }
        pbar.finish_and_clear();

        tracing::info!(
            epochs_run,
            final_loss,
            best_val_accuracy = ?stopping.best(),
            "training finished"
        );
        Ok(TrainingSummary {
            epochs_run,
            stopped_early,
            best_val_accuracy: stopping.best(),
            final_loss,
            final_learning_rate: optimizer.learning_rate(),
            class_weights,
            history,
        })
    }
}

fn progress_bar(epochs: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pbar = ProgressBar::new(epochs as u64);
    pbar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] epoch {pos}/{len} {msg}",
        )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pbar
}

/// Fraction of `indices` whose argmax logit equals the label.
pub fn accuracy(logits: &Tensor, ys: &Tensor, indices: &Tensor) -> candle_core::Result<f32> {
    logits
        .argmax(D::Minus1)?
        .eq(ys)?
        .to_dtype(DType::F32)?
        .i(indices)?
        .mean_all()?
        .to_scalar::<f32>()
}

/// Rescales all gradients so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(
    vars: &[Var],
    grads: &mut GradStore,
    max_norm: f64,
) -> candle_core::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{derive_labels, random_split, SplitRatios, TrailGraph};
    use crate::nn::SageParams;
    use candle_core::Device;

    fn ring_tensors(n: usize) -> GraphTensors {
        let rows = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        let edges = (0..n as u32).map(|i| (i, (i + 1) % n as u32)).collect();
        let graph = TrailGraph::from_rows(rows, edges).unwrap();
        let labels = derive_labels(&graph);
        let partition = random_split(n, SplitRatios::default(), Some(3)).unwrap();
        GraphTensors::new(&graph, &labels, &partition, false, &Device::Cpu).unwrap()
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let device = Device::Cpu;
        let a = Var::new(&[1f32, 1.], &device).unwrap();
        let b = Var::new(&[1f32], &device).unwrap();
        let loss = ((a.as_tensor() * 30.0).unwrap().sum_all().unwrap()
            + (b.as_tensor() * 40.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = [a.clone(), b.clone()];
        let before = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((before - (30f64 * 30. * 2. + 1600.).sqrt()).abs() < 1e-3);
        let after = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!(after <= 1.0 + 1e-5);
    }

    #[test]
    fn training_respects_epoch_and_patience_limits() {
        let data = ring_tensors(40);
        let model = GraphSage::new(40, 3, &Device::Cpu).unwrap();
        let config = TrainerConfig {
            epochs: 30,
            validate_every: 1,
            patience: 2,
            ..Default::default()
        };
        let summary = Trainer::new(config).unwrap().fit(&model, &data).unwrap();
        assert!(summary.epochs_run <= 30);
        assert!(summary.final_loss.is_finite());
        let accs: Vec<f32> = summary.history.iter().filter_map(|c| c.val_accuracy).collect();
        let best = accs.iter().cloned().fold(f32::MIN, f32::max);
        let best_at = accs.iter().position(|&a| a == best).unwrap();
        assert!(accs.len() - 1 - best_at <= 2);
        if summary.stopped_early {
            assert_eq!(accs.len() - 1 - best_at, 2);
        }
    }

    #[test]
    fn empty_validation_runs_every_epoch() {
        let data = ring_tensors(6);
        assert_eq!(data.num_val, 0);
        let params = SageParams {
            hidden_dim: 8,
            ..Default::default()
        };
        let model = GraphSage::with_params(6, 3, &params, &Device::Cpu).unwrap();
        let config = TrainerConfig {
            epochs: 12,
            patience: 1,
            ..Default::default()
        };
        let summary = Trainer::new(config).unwrap().fit(&model, &data).unwrap();
        assert_eq!(summary.epochs_run, 12);
        assert!(!summary.stopped_early);
        assert_eq!(summary.best_val_accuracy, None);
        assert_eq!(summary.history.len(), 2);
    }

    #[test]
    fn nan_features_diverge() {
        let mut data = ring_tensors(10);
        data.xs = (data.xs * f64::NAN).unwrap();
        let model = GraphSage::new(10, 3, &Device::Cpu).unwrap();
        let err = Trainer::new(TrainerConfig::default())
            .unwrap()
            .fit(&model, &data)
            .unwrap_err();
        assert!(matches!(err, Error::TrainingDiverged { epoch: 0, .. }));
    }

    #[test]
    fn zero_patience_is_rejected() {
        let config = TrainerConfig {
            patience: 0,
            ..Default::default()
        };
        assert!(matches!(Trainer::new(config), Err(Error::Config(_))));
    }
}
