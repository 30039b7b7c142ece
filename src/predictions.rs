use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Postgres, QueryBuilder};

use crate::datasets::postgis::{block_on, validate_identifier, with_connection};
use crate::datasets::{DatabaseConfig, TopologyClass};
use crate::error::{Error, Result};
use crate::evaluate::Evaluation;

pub const PREDICTIONS_TABLE: &str = "graphsage_predictions";
// four binds per row, postgres caps a statement at 65535
const UPSERT_CHUNK: usize = 10_000;

/// Snapshot of the run that produced a set of predictions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub model_type: String,
    pub test_accuracy: Option<f32>,
    pub num_nodes: usize,
    pub num_edges: usize,
    pub num_features: usize,
    pub num_classes: usize,
    pub best_val_acc: Option<f32>,
    pub confidence_threshold: f32,
    pub confident_predictions: usize,
    pub prediction_counts: BTreeMap<String, usize>,
    pub dropped_edges: usize,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub class_weights: Vec<f32>,
    pub hyperparameters: serde_json::Value,
    pub prediction_timestamp: DateTime<Utc>,
}

/// Immutable result of one training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionArtifact {
    pub node_ids: Vec<i64>,
    pub predictions: Vec<TopologyClass>,
    pub confidences: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<Vec<f32>>>,
    pub metadata: ArtifactMetadata,
}
impl PredictionArtifact {
    pub fn new(
        evaluation: &Evaluation,
        include_probabilities: bool,
        metadata: ArtifactMetadata,
    ) -> Self {
        let predictions = &evaluation.predictions;
        Self {
            node_ids: predictions.iter().map(|p| p.node_id).collect(),
            predictions: predictions.iter().map(|p| p.class).collect(),
            confidences: predictions.iter().map(|p| p.confidence).collect(),
            probabilities: include_probabilities.then(|| evaluation.probabilities.clone()),
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::data_format(format!("invalid artifact {}: {e}", path.display())))
    }
}

/// Destination for a finished run's predictions.
pub trait PredictionSink {
    fn describe(&self) -> String;
    fn write(&self, artifact: &PredictionArtifact) -> Result<()>;
}

/// Writes the artifact as one JSON document. The file is staged next to its
/// destination and renamed into place.
#[derive(Clone, Debug)]
pub struct JsonArtifactWriter {
    path: PathBuf,
}
impl JsonArtifactWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
}
impl PredictionSink for JsonArtifactWriter {
    fn describe(&self) -> String {
        format!("json artifact {}", self.path.display())
    }

    fn write(&self, artifact: &PredictionArtifact) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
        {
            let mut writer = BufWriter::new(staged.as_file());
            serde_json::to_writer_pretty(&mut writer, artifact)
                .map_err(|e| Error::io(staged.path(), e.into()))?;
            writer.flush().map_err(|e| Error::io(staged.path(), e))?;
        }
        staged
            .persist(&self.path)
            .map_err(|e| Error::io(&self.path, e.error))?;
        tracing::info!(path = %self.path.display(), nodes = artifact.len(), "wrote predictions");
        Ok(())
    }
}

/// Upserts predictions into `{schema}.graphsage_predictions`, keyed by node id.
#[derive(Clone, Debug)]
pub struct PostgisPredictionStore {
    database: DatabaseConfig,
    schema: String,
}
impl PostgisPredictionStore {
    pub fn new(database: DatabaseConfig, schema: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
        }
    }

    fn table(&self) -> Result<String> {
        Ok(format!("{}.{PREDICTIONS_TABLE}", validate_identifier(&self.schema)?))
    }

    async fn upsert(
        conn: &mut PgConnection,
        table: String,
        rows: Vec<(i64, i32, f32)>,
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        let query_error = |source| Error::Connection {
            context: "upsert",
            source,
        };
        let mut tx = conn.begin().await.map_err(query_error)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                node_id BIGINT PRIMARY KEY,
                prediction INTEGER NOT NULL,
                confidence REAL NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let mut written = 0;
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} (node_id, prediction, confidence, created_at) "
            ));
            builder.push_values(chunk, |mut row, &(node_id, prediction, confidence)| {
                row.push_bind(node_id)
                    .push_bind(prediction)
                    .push_bind(confidence)
                    .push_bind(created_at);
            });
            builder.push(
                " ON CONFLICT (node_id) DO UPDATE SET
                    prediction = EXCLUDED.prediction,
                    confidence = EXCLUDED.confidence,
                    created_at = EXCLUDED.created_at",
            );
            written += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(query_error)?
                .rows_affected();
        }
        tx.commit().await.map_err(query_error)?;
        Ok(written)
    }
}
impl PredictionSink for PostgisPredictionStore {
    fn describe(&self) -> String {
        format!("postgis table {}.{PREDICTIONS_TABLE}", self.schema)
    }

    fn write(&self, artifact: &PredictionArtifact) -> Result<()> {
        let table = self.table()?;
        let rows: Vec<(i64, i32, f32)> = itertools::izip!(
            &artifact.node_ids,
            &artifact.predictions,
            &artifact.confidences
        )
        .map(|(&id, &class, &confidence)| (id, class.index() as i32, confidence))
        .collect();
        let created_at = artifact.metadata.prediction_timestamp;
        let written = block_on(with_connection(&self.database, move |conn| {
            Box::pin(Self::upsert(conn, table, rows, created_at))
        }))?;
        tracing::info!(schema = %self.schema, rows = written, "upserted predictions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_artifact() -> PredictionArtifact {
        PredictionArtifact {
            node_ids: vec![10, 11, 12],
            predictions: vec![
                TopologyClass::Keep,
                TopologyClass::MergeDegree2,
                TopologyClass::Keep,
            ],
            confidences: vec![0.5, 0.95, 0.9],
            probabilities: None,
            metadata: ArtifactMetadata {
                model_type: "GraphSAGE".to_owned(),
                test_accuracy: Some(1.0),
                num_nodes: 3,
                num_edges: 2,
                num_features: 5,
                num_classes: 3,
                best_val_acc: None,
                confidence_threshold: 0.8,
                confident_predictions: 2,
                prediction_counts: BTreeMap::from([
                    ("Keep as-is".to_owned(), 2),
                    ("Merge degree-2".to_owned(), 1),
                ]),
                dropped_edges: 0,
                epochs_run: 10,
                stopped_early: false,
                class_weights: vec![1.0, 1.0, 1.5],
                hyperparameters: serde_json::json!({ "hidden_dim": 64 }),
                prediction_timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn json_artifact_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("predictions.json");
        let artifact = sample_artifact();
        JsonArtifactWriter::new(&path).write(&artifact).unwrap();
        assert_eq!(PredictionArtifact::from_json_file(&path).unwrap(), artifact);
        // only the final file remains in the directory
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn predictions_serialize_as_class_indices() {
        let value = serde_json::to_value(sample_artifact()).unwrap();
        assert_eq!(value["predictions"], serde_json::json!([0, 1, 0]));
        assert!(value.get("probabilities").is_none());
    }

    #[test]
    fn store_rejects_bad_schema_before_connecting() {
        let store = PostgisPredictionStore::new(DatabaseConfig::default(), "x y");
        assert!(matches!(store.write(&sample_artifact()), Err(Error::Config(_))));
    }
}
