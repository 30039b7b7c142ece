use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::datasets::{LabelPolicy, PartitionPolicy, SplitRatios};
use crate::error::{Error, Result};
use crate::evaluate::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::nn::SageParams;
use crate::train::{ClassWeighting, PlateauParams, TrainerConfig};

/// Everything one training run needs besides its input.
///
/// Every field has a default, so a TOML file only lists what it overrides:
///
/// ```toml
/// seed = 42
/// confidence_threshold = 0.9
///
/// [model]
/// hidden_dim = 128
///
/// [trainer]
/// epochs = 150
/// class_weighting = { strategy = "inverse_frequency" }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: SageParams,
    pub trainer: TrainerConfig,
    pub split: SplitRatios,
    pub confidence_threshold: f32,
    /// Seeds the random partition. Weight initialisation is not seeded.
    pub seed: Option<u64>,
    pub labels: LabelPolicy,
    pub partition: PartitionPolicy,
    /// Z-score feature columns before training.
    pub standardize_features: bool,
    /// Store the per-node softmax rows in the JSON artifact.
    pub include_probabilities: bool,
    pub artifact_name: String,
    pub use_cuda: bool,
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: SageParams::default(),
            trainer: TrainerConfig::default(),
            split: SplitRatios::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            seed: None,
            labels: LabelPolicy::default(),
            partition: PartitionPolicy::default(),
            standardize_features: true,
            include_probabilities: false,
            artifact_name: "graphsage_predictions.json".to_owned(),
            use_cuda: false,
        }
    }
}
impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if !(2..=3).contains(&model.num_layers) {
            return Err(Error::Config(format!(
                "model.num_layers must be 2 or 3, got {}",
                model.num_layers
            )));
        }
        if model.hidden_dim == 0 || model.head_hidden == Some(0) {
            return Err(Error::Config("model widths must be positive".to_owned()));
        }
        let rates = [
            ("dropout_rate", model.dropout_rate),
            ("head_dropout", model.head_dropout),
        ];
        for (name, rate) in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(Error::Config(format!("model.{name} = {rate} outside [0, 1)")));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold = {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.artifact_name.is_empty() {
            return Err(Error::Config("artifact_name is empty".to_owned()));
        }
        self.trainer.validate()?;
        self.split.validate()
    }

    /// Sets the convolution width; an MLP head keeps half of it.
    pub fn set_hidden_dim(&mut self, hidden_dim: usize) {
        self.model.hidden_dim = hidden_dim;
        self.model.head_hidden = self.model.head_hidden.map(|_| (hidden_dim / 2).max(1));
    }

    pub fn device(&self) -> Result<Device> {
        if self.use_cuda {
            Ok(Device::cuda_if_available(0)?)
        } else {
            Ok(Device::Cpu)
        }
    }
}

/// Named starting points for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Plain two-layer model, uniform loss, no gating.
    Standard,
    /// MLP head and a mild boost for split candidates.
    Balanced,
    /// Slower, more regularised training gated at 0.8 confidence.
    HighConfidence,
    /// Deeper residual model with inverse-frequency weights and an
    /// adaptive learning rate.
    Improved,
}
impl Preset {
    pub fn config(self) -> PipelineConfig {
        let base = PipelineConfig::default();
        match self {
            Self::Standard => PipelineConfig {
                model: SageParams {
                    hidden_dim: 64,
                    num_layers: 2,
                    dropout_rate: 0.5,
                    ..Default::default()
                },
                trainer: TrainerConfig {
                    class_weighting: ClassWeighting::Uniform,
                    patience: 100,
                    ..Default::default()
                },
                confidence_threshold: 0.0,
                ..base
            },
            Self::Balanced => PipelineConfig {
                model: SageParams {
                    dropout_rate: 0.0,
                    head_hidden: Some(32),
                    head_dropout: 0.2,
                    ..Default::default()
                },
                trainer: TrainerConfig {
                    learning_rate: 0.005,
                    weight_decay: 1e-4,
                    class_weighting: ClassWeighting::Conservative { split_weight: 1.5 },
                    ..Default::default()
                },
                artifact_name: "balanced_graphsage_predictions.json".to_owned(),
                ..base
            },
            Self::HighConfidence => PipelineConfig {
                model: SageParams {
                    dropout_rate: 0.0,
                    head_hidden: Some(32),
                    head_dropout: 0.3,
                    ..Default::default()
                },
                trainer: TrainerConfig {
                    epochs: 150,
                    learning_rate: 0.003,
                    weight_decay: 1e-4,
                    validate_every: 15,
                    class_weighting: ClassWeighting::Conservative { split_weight: 1.2 },
                    ..Default::default()
                },
                confidence_threshold: 0.8,
                artifact_name: "high_confidence_graphsage_predictions.json".to_owned(),
                ..base
            },
            Self::Improved => PipelineConfig {
                model: SageParams {
                    hidden_dim: 128,
                    num_layers: 3,
                    dropout_rate: 0.5,
                    residual: true,
                    head_hidden: Some(64),
                    head_dropout: 0.3,
                },
                trainer: TrainerConfig {
                    epochs: 200,
                    weight_decay: 1e-4,
                    patience: 5,
                    class_weighting: ClassWeighting::InverseFrequency,
                    plateau: Some(PlateauParams::default()),
                    ..Default::default()
                },
                artifact_name: "improved_graphsage_predictions.json".to_owned(),
                ..base
            },
        }
    }
}
