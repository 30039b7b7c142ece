use std::io::Write;

use serde_json::json;
use tempfile::NamedTempFile;

use trail_sage::datasets::{JsonExportLoader, TopologyClass};
use trail_sage::nn::SageParams;
use trail_sage::predictions::{JsonArtifactWriter, PredictionSink};
use trail_sage::train::{ClassWeighting, TrainerConfig};
use trail_sage::{Error, Pipeline, PipelineConfig, Preset};

fn export_file(value: serde_json::Value) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{value}").unwrap();
    file
}

fn ring_export(n: usize) -> serde_json::Value {
    let x: Vec<Vec<f32>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let sources: Vec<usize> = (0..n).collect();
    let targets: Vec<usize> = (0..n).map(|i| (i + 1) % n).collect();
    json!({ "x": x, "edge_index": ([sources, targets].concat()) })
}

fn quick_config(epochs: usize) -> PipelineConfig {
    PipelineConfig {
        model: SageParams {
            hidden_dim: 16,
            dropout_rate: 0.0,
            ..Default::default()
        },
        trainer: TrainerConfig {
            epochs,
            patience: epochs,
            class_weighting: ClassWeighting::Uniform,
            ..Default::default()
        },
        seed: Some(0),
        ..Default::default()
    }
}

#[test]
fn ring_of_six_is_learned_perfectly() {
    let file = export_file(ring_export(6));
    let mut config = PipelineConfig {
        standardize_features: false,
        ..quick_config(200)
    };
    config.trainer.learning_rate = 0.02;
    let outcome = Pipeline::new(config)
        .unwrap()
        .run(&JsonExportLoader::new(file.path()))
        .unwrap();

    // floor(0.7 * 6) = 4 train, floor(0.15 * 6) = 0 val, 2 test
    assert_eq!(outcome.training.best_val_accuracy, None);
    assert!(!outcome.training.stopped_early);
    assert_eq!(outcome.training.epochs_run, 200);

    // every node clears the default 0.8 gate
    let report = &outcome.evaluation.report;
    assert_eq!(report.confidence_threshold, 0.8);
    assert_eq!(report.confident_predictions, 6);
    assert_eq!(report.test_accuracy, Some(1.0));
    assert_eq!(report.raw_test_accuracy, Some(1.0));
    assert!(outcome
        .artifact
        .predictions
        .iter()
        .all(|&c| c == TopologyClass::MergeDegree2));
}

#[test]
fn out_of_range_edge_is_dropped_and_training_proceeds() {
    let mut export = ring_export(10);
    let mut sources: Vec<i64> = (0..9).collect();
    let mut targets: Vec<i64> = (1..10).collect();
    sources.push(0);
    targets.push(999);
    export["edge_index"] = json!([sources, targets].concat());
    let file = export_file(export);

    let outcome = Pipeline::new(quick_config(5))
        .unwrap()
        .run(&JsonExportLoader::new(file.path()))
        .unwrap();
    let metadata = &outcome.artifact.metadata;
    assert_eq!(metadata.dropped_edges, 1);
    assert_eq!(metadata.num_edges, 9);
    assert_eq!(metadata.num_nodes, 10);
    assert_eq!(outcome.artifact.len(), 10);
}

#[test]
fn artifact_carries_run_metadata() {
    let file = export_file(ring_export(12));
    let config = PipelineConfig {
        include_probabilities: true,
        ..quick_config(3)
    };
    let outcome = Pipeline::new(config)
        .unwrap()
        .run(&JsonExportLoader::new(file.path()))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graphsage_predictions.json");
    JsonArtifactWriter::new(&path).write(&outcome.artifact).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["predictions"].as_array().unwrap().len(), 12);
    assert_eq!(value["probabilities"].as_array().unwrap().len(), 12);
    let metadata = value["metadata"].as_object().unwrap();
    for key in [
        "model_type",
        "test_accuracy",
        "num_nodes",
        "num_edges",
        "num_features",
        "num_classes",
        "best_val_acc",
        "confidence_threshold",
        "confident_predictions",
        "prediction_counts",
        "dropped_edges",
        "epochs_run",
        "stopped_early",
        "class_weights",
        "hyperparameters",
        "prediction_timestamp",
    ] {
        assert!(metadata.contains_key(key), "missing {key}");
    }
    assert_eq!(metadata["num_classes"], json!(3));
    assert_eq!(metadata["hyperparameters"]["model"]["hidden_dim"], json!(16));
}

#[test]
fn gated_predictions_respect_threshold() {
    let file = export_file(ring_export(20));
    let mut config = Preset::HighConfidence.config();
    config.trainer.epochs = 3;
    config.seed = Some(9);
    let outcome = Pipeline::new(config)
        .unwrap()
        .run(&JsonExportLoader::new(file.path()))
        .unwrap();
    for p in &outcome.evaluation.predictions {
        if p.confidence < 0.8 {
            assert_eq!(p.class, TopologyClass::Keep);
        } else {
            assert_eq!(p.class, p.raw_class);
        }
    }
}

#[test]
fn missing_input_is_an_io_error() {
    let err = Pipeline::new(quick_config(1))
        .unwrap()
        .run(&JsonExportLoader::new("/nonexistent/network.json"))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Io { .. }));
}
