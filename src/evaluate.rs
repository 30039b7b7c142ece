use std::collections::HashMap;

use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use itertools::Itertools;
use serde::Serialize;

use crate::datasets::{GraphTensors, TopologyClass};
use crate::error::{Error, Result};
use crate::nn::{GnnModule, GraphSage};
use crate::utils::{index_tensor, mask_to_index};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.8;
/// Split share above which the distribution looks over-eager.
pub const MAX_SPLIT_SHARE: f64 = 0.10;
/// Split share below which the model has probably collapsed.
pub const MIN_SPLIT_SHARE: f64 = 0.005;

/// Index and value of the largest probability. Ties keep the lowest index.
pub fn argmax(probs: &[f32]) -> (usize, f32) {
    probs
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best })
}

/// Argmax class, unless its probability is below `threshold`, in which case
/// the node is left alone.
pub fn gate(probs: &[f32], threshold: f32) -> TopologyClass {
    let (class, confidence) = argmax(probs);
    if confidence < threshold {
        TopologyClass::Keep
    } else {
        TopologyClass::from_index(class).unwrap_or(TopologyClass::Keep)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct NodePrediction {
    pub node_id: i64,
    /// Class after the confidence gate.
    pub class: TopologyClass,
    pub raw_class: TopologyClass,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClassAccuracy {
    pub class: TopologyClass,
    pub support: usize,
    pub accuracy: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClassCount {
    pub class: TopologyClass,
    pub count: usize,
    pub percent: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    TooManySplits { share: f64 },
    TooFewSplits { share: f64 },
}
impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::TooManySplits { share } => write!(
                f,
                "{:.1}% of nodes flagged for splitting (> {:.1}%)",
                100.0 * share,
                100.0 * MAX_SPLIT_SHARE
            ),
            Self::TooFewSplits { share } => write!(
                f,
                "{:.2}% of nodes flagged for splitting (< {:.1}%)",
                100.0 * share,
                100.0 * MIN_SPLIT_SHARE
            ),
        }
    }
}

/// Test-partition counts; rows are true classes, columns predicted ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix(pub [[usize; TopologyClass::COUNT]; TopologyClass::COUNT]);
impl ConfusionMatrix {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (TopologyClass, TopologyClass)>) -> Self {
        let mut matrix = Self::default();
        for (truth, predicted) in pairs {
            matrix.0[truth.index()][predicted.index()] += 1;
        }
        matrix
    }

    pub fn count(&self, truth: TopologyClass, predicted: TopologyClass) -> usize {
        self.0[truth.index()][predicted.index()]
    }
    pub fn support(&self, class: TopologyClass) -> usize {
        self.0[class.index()].iter().sum()
    }
    pub fn predicted(&self, class: TopologyClass) -> usize {
        self.0.iter().map(|row| row[class.index()]).sum()
    }

    /// Precision, recall and F1 per class. Undefined ratios are 0.
    pub fn metrics(&self) -> Vec<ClassMetrics> {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
        TopologyClass::ALL
            .iter()
            .map(|&class| {
                let hits = self.count(class, class);
                let precision = ratio(hits, self.predicted(class));
                let recall = ratio(hits, self.support(class));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    class,
                    precision,
                    recall,
                    f1,
                    support: self.support(class),
                }
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub class: TopologyClass,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub support: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub confidence_threshold: f32,
    /// Gated predictions against labels on the test partition.
    pub test_accuracy: Option<f32>,
    pub raw_test_accuracy: Option<f32>,
    /// Test-partition accuracy for every class with support.
    pub per_class: Vec<ClassAccuracy>,
    /// Gated predictions on the test partition.
    pub confusion_matrix: Option<ConfusionMatrix>,
    pub class_metrics: Vec<ClassMetrics>,
    /// Gated prediction counts over all nodes.
    pub distribution: Vec<ClassCount>,
    pub raw_counts: Vec<usize>,
    pub confident_predictions: usize,
    pub advisories: Vec<Advisory>,
}
impl EvaluationReport {
    pub fn prediction_counts(&self) -> HashMap<String, usize> {
        self.distribution
            .iter()
            .map(|c| (c.class.name().to_owned(), c.count))
            .collect()
    }

    pub fn log(&self) {
        tracing::info!(
            test_accuracy = ?self.test_accuracy,
            raw_test_accuracy = ?self.raw_test_accuracy,
            confident = self.confident_predictions,
            threshold = self.confidence_threshold,
            "evaluation"
        );
        for c in &self.per_class {
            tracing::info!(
                class = %c.class,
                support = c.support,
                accuracy = c.accuracy,
                "per-class accuracy"
            );
        }
        for m in &self.class_metrics {
            tracing::info!(
                class = %m.class,
                precision = format_args!("{:.3}", m.precision),
                recall = format_args!("{:.3}", m.recall),
                f1 = format_args!("{:.3}", m.f1),
                support = m.support,
                "classification report"
            );
        }
        if let Some(matrix) = &self.confusion_matrix {
            for (class, row) in TopologyClass::ALL.iter().zip(&matrix.0) {
                tracing::info!(class = %class, predicted = ?row, "confusion matrix");
            }
        }
        for c in &self.distribution {
            tracing::info!(
                class = %c.class,
                count = c.count,
                percent = format_args!("{:.1}", c.percent),
                "predictions"
            );
        }
        for advisory in &self.advisories {
            tracing::warn!(%advisory, "prediction distribution looks suspicious");
        }
    }
}

#[derive(Clone, Debug)]
pub struct Evaluation {
    pub predictions: Vec<NodePrediction>,
    /// Softmax rows, one per node.
    pub probabilities: Vec<Vec<f32>>,
    pub report: EvaluationReport,
}

/// Inference over every node followed by the confidence gate. Never touches
/// model parameters.
#[derive(Clone, Copy, Debug)]
pub struct Evaluator {
    threshold: f32,
}
impl Default for Evaluator {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}
impl Evaluator {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "confidence threshold {threshold} outside [0, 1]"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn evaluate(
        &self,
        model: &GraphSage,
        data: &GraphTensors,
        node_ids: &[i64],
    ) -> Result<Evaluation> {
        let logits = model.forward_t(&data.xs, &data.edge_index, false)?;
        let probabilities = softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
        if probabilities.len() != node_ids.len() {
            return Err(Error::data_format(format!(
                "{} node ids for {} logit rows",
                node_ids.len(),
                probabilities.len()
            )));
        }

        let predictions: Vec<NodePrediction> = node_ids
            .iter()
            .zip(&probabilities)
            .map(|(&node_id, probs)| {
                let (raw, confidence) = argmax(probs);
                NodePrediction {
                    node_id,
                    class: gate(probs, self.threshold),
                    raw_class: TopologyClass::from_index(raw).unwrap_or(TopologyClass::Keep),
                    confidence,
                }
            })
            .collect();

        let report = self.report(&predictions, data)?;
        Ok(Evaluation {
            predictions,
            probabilities,
            report,
        })
    }

    /// Scores already-gated predictions (one per node, in node order)
    /// against the labels in `data`.
    pub fn report(
        &self,
        predictions: &[NodePrediction],
        data: &GraphTensors,
    ) -> Result<EvaluationReport> {
        if predictions.len() != data.ys.dim(0)? {
            return Err(Error::data_format(format!(
                "{} predictions for {} nodes",
                predictions.len(),
                data.ys.dim(0)?
            )));
        }
        let device = data.ys.device();
        let gated: Vec<u32> = predictions.iter().map(|p| p.class.index() as u32).collect();
        let raw: Vec<u32> = predictions.iter().map(|p| p.raw_class.index() as u32).collect();
        let gated_ok = index_tensor(&gated, device)?.eq(&data.ys)?;
        let raw_ok = index_tensor(&raw, device)?.eq(&data.ys)?;

        let mut report = EvaluationReport {
            confidence_threshold: self.threshold,
            test_accuracy: None,
            raw_test_accuracy: None,
            per_class: Vec::new(),
            confusion_matrix: None,
            class_metrics: Vec::new(),
            distribution: Vec::new(),
            raw_counts: Vec::new(),
            confident_predictions: predictions
                .iter()
                .filter(|p| p.confidence >= self.threshold)
                .count(),
            advisories: Vec::new(),
        };

        if data.num_test > 0 {
            let test_ys = data.ys.i(&data.test_indices)?;
            let test_ok = gated_ok.i(&data.test_indices)?;
            for class in TopologyClass::ALL {
                let members = mask_to_index(&test_ys.eq(class.index() as u32)?)?;
                let support = members.dim(0)?;
                if support > 0 {
                    report.per_class.push(ClassAccuracy {
                        class,
                        support,
                        accuracy: mean_of(&test_ok.i(&members)?)?,
                    });
                }
            }
            report.test_accuracy = Some(mean_of(&test_ok)?);
            report.raw_test_accuracy = Some(mean_of(&raw_ok.i(&data.test_indices)?)?);

            let nodes = data.test_indices.to_vec1::<u32>()?;
            let labels = test_ys.to_vec1::<u32>()?;
            let matrix = ConfusionMatrix::from_pairs(nodes.iter().zip(&labels).filter_map(
                |(&node, &label)| {
                    let truth = TopologyClass::from_index(label as usize)?;
                    Some((truth, predictions[node as usize].class))
                },
            ));
            report.class_metrics = matrix.metrics();
            report.confusion_matrix = Some(matrix);
        }

        let n = predictions.len().max(1) as f64;
        let gated_counts = predictions.iter().counts_by(|p| p.class);
        let raw_counts = predictions.iter().counts_by(|p| p.raw_class);
        report.distribution = TopologyClass::ALL
            .iter()
            .map(|class| {
                let count = gated_counts.get(class).copied().unwrap_or(0);
                ClassCount {
                    class: *class,
                    count,
                    percent: 100.0 * count as f64 / n,
                }
            })
            .collect();
        report.raw_counts = TopologyClass::ALL
            .iter()
            .map(|c| raw_counts.get(c).copied().unwrap_or(0))
            .collect();

        let split_share = report.distribution[TopologyClass::SplitYT.index()].count as f64 / n;
        if split_share > MAX_SPLIT_SHARE {
            report.advisories.push(Advisory::TooManySplits { share: split_share });
        } else if split_share < MIN_SPLIT_SHARE {
            report.advisories.push(Advisory::TooFewSplits { share: split_share });
        }
        Ok(report)
    }
}

fn mean_of(mask: &Tensor) -> candle_core::Result<f32> {
    mask.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()
}
