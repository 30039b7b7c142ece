use candle_core::Device;
use chrono::Utc;

use crate::config::PipelineConfig;
use crate::datasets::{
    derive_labels, random_split, GraphLoader, GraphTensors, LabelPolicy, LoadedGraph, Partition,
    PartitionPolicy, TopologyClass,
};
use crate::error::{Error, Result};
use crate::evaluate::{Evaluation, Evaluator};
use crate::nn::GraphSage;
use crate::predictions::{ArtifactMetadata, PredictionArtifact};
use crate::train::{Trainer, TrainingSummary};

pub const MODEL_TYPE: &str = "GraphSAGE";

/// Everything a finished run produced.
pub struct RunOutcome {
    pub model: GraphSage,
    pub training: TrainingSummary,
    pub evaluation: Evaluation,
    pub artifact: PredictionArtifact,
}

/// Loader → labels → partition → training → evaluation.
pub struct Pipeline {
    config: PipelineConfig,
    device: Device,
}
impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        Ok(Self { config, device })
    }

    pub fn run(&self, loader: &dyn GraphLoader) -> Result<RunOutcome> {
        tracing::info!(source = %loader.describe(), "loading graph");
        let loaded = loader.load()?;
        self.run_loaded(loaded)
    }

    pub fn run_loaded(&self, loaded: LoadedGraph) -> Result<RunOutcome> {
        let config = &self.config;
        let graph = &loaded.graph;
        tracing::info!(
            nodes = graph.num_nodes(),
            edges = graph.num_edges(),
            features = graph.num_features(),
            dropped_edges = loaded.dropped_edges,
            "graph ready"
        );

        let labels = resolve_labels(config.labels, &loaded)?;
        let partition = resolve_partition(config, &loaded)?;
        let data = GraphTensors::new(
            graph,
            &labels,
            &partition,
            config.standardize_features,
            &self.device,
        )?;
        tracing::info!(
            train = data.num_train,
            val = data.num_val,
            test = data.num_test,
            "partition"
        );

        let model = GraphSage::with_params(
            graph.num_features(),
            TopologyClass::COUNT,
            &config.model,
            &self.device,
        )?;
        tracing::info!(parameters = model.num_parameters(), params = ?config.model, "model");

        let trainer = Trainer::new(config.trainer.clone())?;
        let training = trainer.fit(&model, &data)?;

        let evaluation =
            Evaluator::new(config.confidence_threshold)?.evaluate(&model, &data, graph.node_ids())?;
        evaluation.report.log();

        let report = &evaluation.report;
        let metadata = ArtifactMetadata {
            model_type: MODEL_TYPE.to_owned(),
            test_accuracy: report.test_accuracy,
            num_nodes: graph.num_nodes(),
            num_edges: graph.num_edges(),
            num_features: graph.num_features(),
            num_classes: TopologyClass::COUNT,
            best_val_acc: training.best_val_accuracy,
            confidence_threshold: report.confidence_threshold,
            confident_predictions: report.confident_predictions,
            prediction_counts: report.prediction_counts().into_iter().collect(),
            dropped_edges: loaded.dropped_edges,
            epochs_run: training.epochs_run,
            stopped_early: training.stopped_early,
            class_weights: training.class_weights.clone(),
            hyperparameters: serde_json::to_value(config)
                .map_err(|e| Error::Config(format!("unserializable config: {e}")))?,
            prediction_timestamp: Utc::now(),
        };
        let artifact = PredictionArtifact::new(&evaluation, config.include_probabilities, metadata);

        Ok(RunOutcome {
            model,
            training,
            evaluation,
            artifact,
        })
    }
}

pub fn resolve_labels(policy: LabelPolicy, loaded: &LoadedGraph) -> Result<Vec<TopologyClass>> {
    match (policy, &loaded.labels) {
        (LabelPolicy::Auto | LabelPolicy::Supplied, Some(labels)) => {
            tracing::info!("using supplied labels");
            Ok(labels.clone())
        }
        (LabelPolicy::Supplied, None) => Err(Error::data_format("source carries no labels")),
        (LabelPolicy::Auto | LabelPolicy::Derived, _) => {
            tracing::info!("deriving labels from node degree");
            Ok(derive_labels(&loaded.graph))
        }
    }
}

pub fn resolve_partition(config: &PipelineConfig, loaded: &LoadedGraph) -> Result<Partition> {
    match (config.partition, &loaded.partition) {
        (PartitionPolicy::Auto | PartitionPolicy::Supplied, Some(partition)) => {
            tracing::info!("using supplied masks");
            Ok(partition.clone())
        }
        (PartitionPolicy::Supplied, None) => {
            Err(Error::data_format("source carries no train/val/test masks"))
        }
        (PartitionPolicy::Auto | PartitionPolicy::Random, _) => {
            tracing::info!(seed = ?config.seed, "random partition");
            random_split(loaded.graph.num_nodes(), config.split, config.seed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{JsonExportLoader, Split};

    const LABELLED: &str = r#"{
        "x": [[0.0], [1.0], [2.0], [3.0]],
        "edge_index": [0, 1, 2, 1, 2, 3],
        "y": [0, 0, 0, 0],
        "train_mask": [true, true, false, false],
        "val_mask": [false, false, true, false],
        "test_mask": [false, false, false, true]
    }"#;
    const BARE: &str = r#"{"x": [[0.0], [1.0], [2.0]], "edge_index": [0, 1, 1, 2]}"#;

    #[test]
    fn auto_prefers_supplied_labels() {
        let loaded = JsonExportLoader::parse_str(LABELLED).unwrap();
        let labels = resolve_labels(LabelPolicy::Auto, &loaded).unwrap();
        assert_eq!(labels, vec![TopologyClass::Keep; 4]);
        let derived = resolve_labels(LabelPolicy::Derived, &loaded).unwrap();
        assert_eq!(derived[1], TopologyClass::MergeDegree2);
    }

    #[test]
    fn supplied_policy_requires_labels() {
        let loaded = JsonExportLoader::parse_str(BARE).unwrap();
        assert!(matches!(
            resolve_labels(LabelPolicy::Supplied, &loaded),
            Err(Error::DataFormat(_))
        ));
    }

    #[test]
    fn partition_policies() {
        let labelled = JsonExportLoader::parse_str(LABELLED).unwrap();
        let config = PipelineConfig::default();
        let partition = resolve_partition(&config, &labelled).unwrap();
        assert_eq!(partition.get(3), Split::Test);

        let bare = JsonExportLoader::parse_str(BARE).unwrap();
        let config = PipelineConfig {
            partition: PartitionPolicy::Supplied,
            ..Default::default()
        };
        assert!(resolve_partition(&config, &bare).is_err());
        let config = PipelineConfig {
            partition: PartitionPolicy::Random,
            seed: Some(1),
            ..Default::default()
        };
        assert_eq!(resolve_partition(&config, &labelled).unwrap().len(), 4);
    }
}
