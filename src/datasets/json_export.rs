use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::graph::{validate_edges, TopologyClass, TrailGraph};
use super::split::Partition;
use super::traits::{ExportMetadata, GraphLoader, LoadedGraph};
use crate::error::{Error, Result};

// Layout written by the PostGIS export step:
//
// {
//   "x": [[lon, lat, elevation, degree, avg_len], ...],
//   "edge_index": [s_0, ..., s_E, t_0, ..., t_E],
//   "y": [0, 1, 2, ...],
//   "train_mask": [true, false, ...], "val_mask": [...], "test_mask": [...],
//   "metadata": { "num_nodes": ..., "num_edges": ..., ... }
// }
#[derive(Debug, Deserialize)]
struct RawExport {
    x: Vec<Vec<f32>>,
    edge_index: RawEdgeIndex,
    #[serde(default)]
    y: Option<Vec<i64>>,
    #[serde(default)]
    train_mask: Option<Vec<bool>>,
    #[serde(default)]
    val_mask: Option<Vec<bool>>,
    #[serde(default)]
    test_mask: Option<Vec<bool>>,
    #[serde(default)]
    node_ids: Option<Vec<i64>>,
    #[serde(default)]
    metadata: Option<ExportMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEdgeIndex {
    Flat(Vec<i64>),
    Rows(Vec<Vec<i64>>),
}
impl RawEdgeIndex {
    /// Reshapes to `(source, target)` pairs, i.e. the columns of a 2 x E view.
    fn into_pairs(self) -> Result<Vec<(i64, i64)>> {
        let (sources, targets) = match self {
            Self::Flat(flat) => {
                if flat.len() % 2 != 0 {
                    return Err(Error::data_format(format!(
                        "edge_index has odd length {}",
                        flat.len()
                    )));
                }
                let (s, t) = flat.split_at(flat.len() / 2);
                (s.to_vec(), t.to_vec())
            }
            Self::Rows(mut rows) => {
                if rows.len() != 2 || rows[0].len() != rows[1].len() {
                    return Err(Error::data_format(
                        "edge_index rows must be two lists of equal length",
                    ));
                }
                let t = rows.pop().unwrap_or_default();
                let s = rows.pop().unwrap_or_default();
                (s, t)
            }
        };
        Ok(sources.into_iter().zip(targets).collect())
    }
}

/// Loads the flat JSON export produced by the PostGIS extraction step.
#[derive(Clone, Debug)]
pub struct JsonExportLoader {
    path: PathBuf,
}
impl JsonExportLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn parse_str(json: &str) -> Result<LoadedGraph> {
        let raw: RawExport = serde_json::from_str(json)
            .map_err(|e| Error::data_format(format!("invalid export: {e}")))?;
        Self::build(raw)
    }

    fn build(raw: RawExport) -> Result<LoadedGraph> {
        let n = raw.x.len();
        if n == 0 {
            return Err(Error::data_format("export contains no nodes"));
        }

        let checked = validate_edges(&raw.edge_index.into_pairs()?, n);
        if checked.dropped > 0 {
            tracing::warn!(
                dropped = checked.dropped,
                kept = checked.edges.len(),
                max_index = n - 1,
                "dropped edges with out-of-range node indices"
            );
        }
        if checked.edges.is_empty() {
            return Err(Error::GraphIntegrity {
                node_count: n,
                dropped: checked.dropped,
            });
        }

        let mut graph = TrailGraph::from_rows(raw.x, checked.edges)?;
        if let Some(node_ids) = raw.node_ids {
            if node_ids.len() != n {
                return Err(Error::data_format(format!(
                    "{} node_ids for {n} nodes",
                    node_ids.len()
                )));
            }
            graph = TrailGraph::new(
                node_ids,
                graph.features().to_vec(),
                graph.num_features(),
                graph.edges().to_vec(),
            )?;
        }

        let labels = raw
            .y
            .map(|y| {
                if y.len() != n {
                    return Err(Error::data_format(format!("{} labels for {n} nodes", y.len())));
                }
                y.into_iter()
                    .enumerate()
                    .map(|(node, label)| {
                        usize::try_from(label)
                            .ok()
                            .and_then(TopologyClass::from_index)
                            .ok_or_else(|| {
                                Error::data_format(format!("node {node} has unknown label {label}"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let partition = match (raw.train_mask, raw.val_mask, raw.test_mask) {
            (Some(train), Some(val), Some(test)) => {
                if train.len() != n {
                    return Err(Error::data_format(format!(
                        "masks cover {} nodes, graph has {n}",
                        train.len()
                    )));
                }
                Some(Partition::from_masks(&train, &val, &test)?)
            }
            (None, None, None) => None,
            _ => {
                return Err(Error::data_format(
                    "train_mask, val_mask and test_mask must be supplied together",
                ))
            }
        };

        let metadata = raw.metadata.unwrap_or_default();
        check_metadata(&metadata, &graph);

        Ok(LoadedGraph {
            graph,
            labels,
            partition,
            dropped_edges: checked.dropped,
            metadata,
        })
    }
}

fn check_metadata(metadata: &ExportMetadata, graph: &TrailGraph) {
    let checks = [
        ("num_nodes", metadata.num_nodes, graph.num_nodes()),
        ("num_features", metadata.num_features, graph.num_features()),
        ("num_classes", metadata.num_classes, TopologyClass::COUNT),
    ];
    for (field, declared, actual) in checks {
        if let Some(declared) = declared.filter(|&d| d != actual) {
            tracing::warn!(field, declared, actual, "export metadata disagrees with data");
        }
    }
}

impl GraphLoader for JsonExportLoader {
    fn describe(&self) -> String {
        format!("json export {}", self.path.display())
    }

    fn load(&self) -> Result<LoadedGraph> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let raw: RawExport = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::data_format(format!("invalid export {}: {e}", self.path.display()))
        })?;
        Self::build(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Split;

    #[test]
    fn flat_edge_index_is_reshaped_to_pairs() {
        let loaded = JsonExportLoader::parse_str(
            r#"{"x": [[0.0], [1.0], [2.0]], "edge_index": [0, 1, 1, 2]}"#,
        )
        .unwrap();
        assert_eq!(loaded.graph.edges(), &[(0, 1), (1, 2)]);
        assert!(loaded.labels.is_none());
        assert!(loaded.partition.is_none());
    }

    #[test]
    fn nested_edge_index_is_accepted() {
        let loaded = JsonExportLoader::parse_str(
            r#"{"x": [[0.0], [1.0], [2.0]], "edge_index": [[0, 1], [1, 2]]}"#,
        )
        .unwrap();
        assert_eq!(loaded.graph.edges(), &[(0, 1), (1, 2)]);
    }

    #[test]
    fn supplied_labels_and_masks_are_kept() {
        let loaded = JsonExportLoader::parse_str(
            r#"{
                "x": [[0.0], [1.0], [2.0]],
                "edge_index": [0, 1, 1, 2],
                "y": [0, 1, 2],
                "train_mask": [true, false, false],
                "val_mask": [false, true, false],
                "test_mask": [false, false, true],
                "metadata": {"num_nodes": 3, "num_edges": 2, "num_features": 1, "num_classes": 3}
            }"#,
        )
        .unwrap();
        assert_eq!(
            loaded.labels.unwrap(),
            vec![
                TopologyClass::Keep,
                TopologyClass::MergeDegree2,
                TopologyClass::SplitYT
            ]
        );
        let partition = loaded.partition.unwrap();
        assert_eq!(partition.get(0), Split::Train);
        assert_eq!(partition.get(2), Split::Test);
        assert_eq!(loaded.metadata.num_edges, Some(2));
    }

    #[test]
    fn missing_features_is_a_format_error() {
        let err = JsonExportLoader::parse_str(r#"{"edge_index": [0, 1]}"#).unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn odd_flat_edge_index_is_a_format_error() {
        let err =
            JsonExportLoader::parse_str(r#"{"x": [[0.0], [1.0]], "edge_index": [0, 1, 1]}"#)
                .unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn label_count_mismatch_is_a_format_error() {
        let err = JsonExportLoader::parse_str(
            r#"{"x": [[0.0], [1.0]], "edge_index": [0, 1], "y": [0]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn unknown_label_is_a_format_error() {
        let err = JsonExportLoader::parse_str(
            r#"{"x": [[0.0], [1.0]], "edge_index": [0, 1], "y": [0, 7]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn partial_masks_are_a_format_error() {
        let err = JsonExportLoader::parse_str(
            r#"{"x": [[0.0], [1.0]], "edge_index": [0, 1], "train_mask": [true, false]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn all_edges_invalid_is_an_integrity_error() {
        let err = JsonExportLoader::parse_str(r#"{"x": [[0.0], [1.0]], "edge_index": [0, 5]}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::GraphIntegrity {
                node_count: 2,
                dropped: 1
            }
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = JsonExportLoader::new("/nonexistent/export.json")
            .load()
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
