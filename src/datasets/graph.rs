use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use super::split::{Partition, Split};
use crate::error::{Error, Result};
use crate::utils::index_tensor;

/// Topology-cleaning recommendation for a single trail node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TopologyClass {
    Keep,
    MergeDegree2,
    SplitYT,
}
impl TopologyClass {
    pub const ALL: [TopologyClass; 3] = [Self::Keep, Self::MergeDegree2, Self::SplitYT];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
    pub fn name(self) -> &'static str {
        match self {
            Self::Keep => "Keep as-is",
            Self::MergeDegree2 => "Merge degree-2",
            Self::SplitYT => "Split Y/T",
        }
    }
}
impl std::fmt::Display for TopologyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
impl From<TopologyClass> for u8 {
    fn from(class: TopologyClass) -> u8 {
        class as u8
    }
}
impl TryFrom<u8> for TopologyClass {
    type Error = String;
    fn try_from(value: u8) -> std::result::Result<Self, String> {
        Self::from_index(value as usize).ok_or_else(|| format!("unknown class {value}"))
    }
}

/// Result of checking raw endpoint pairs against a node count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeValidation {
    pub edges: Vec<(u32, u32)>,
    pub dropped: usize,
}

/// Keeps the pairs whose endpoints both satisfy `0 <= index < node_count`.
pub fn validate_edges(raw: &[(i64, i64)], node_count: usize) -> EdgeValidation {
    let in_range = |i: i64| i >= 0 && (i as u64) < node_count as u64;
    let edges: Vec<(u32, u32)> = raw
        .iter()
        .filter(|&&(s, t)| in_range(s) && in_range(t))
        .map(|&(s, t)| (s as u32, t as u32))
        .collect();
    EdgeValidation {
        dropped: raw.len() - edges.len(),
        edges,
    }
}

/// Trail network graph: node identities, a dense feature matrix and a
/// validated edge list.
#[derive(Clone, Debug)]
pub struct TrailGraph {
    node_ids: Vec<i64>,
    features: Vec<f32>, // row-major, node_count x num_features
    num_features: usize,
    edges: Vec<(u32, u32)>,
    // degrees reported by the source, counting edges filtered out here
    source_degrees: Option<Vec<usize>>,
}
impl TrailGraph {
    pub fn new(
        node_ids: Vec<i64>,
        features: Vec<f32>,
        num_features: usize,
        edges: Vec<(u32, u32)>,
    ) -> Result<Self> {
        let n = node_ids.len();
        if num_features == 0 {
            return Err(Error::data_format("feature rows are empty"));
        }
        if features.len() != n * num_features {
            return Err(Error::data_format(format!(
                "feature matrix has {} values, expected {n} x {num_features}",
                features.len()
            )));
        }
        if let Some(&(s, t)) = edges
            .iter()
            .find(|&&(s, t)| s as usize >= n || t as usize >= n)
        {
            return Err(Error::data_format(format!(
                "edge ({s}, {t}) references a node outside 0..{n}"
            )));
        }
        Ok(Self {
            node_ids,
            features,
            num_features,
            edges,
            source_degrees: None,
        })
    }

    /// Replaces the edge-derived degrees with ones counted by the source.
    pub fn with_source_degrees(mut self, degrees: Vec<usize>) -> Result<Self> {
        if degrees.len() != self.num_nodes() {
            return Err(Error::data_format(format!(
                "{} degrees for {} nodes",
                degrees.len(),
                self.num_nodes()
            )));
        }
        self.source_degrees = Some(degrees);
        Ok(self)
    }

    /// Builds a graph from feature rows, assigning dense ids `0..n`.
    pub fn from_rows(rows: Vec<Vec<f32>>, edges: Vec<(u32, u32)>) -> Result<Self> {
        let num_features = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(pos) = rows.iter().position(|r| r.len() != num_features) {
            return Err(Error::data_format(format!(
                "feature row {pos} has {} columns, expected {num_features}",
                rows[pos].len()
            )));
        }
        let node_ids = (0..rows.len() as i64).collect();
        Self::new(node_ids, rows.concat(), num_features, edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_ids.len()
    }
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
    pub fn num_features(&self) -> usize {
        self.num_features
    }
    pub fn node_ids(&self) -> &[i64] {
        &self.node_ids
    }
    pub fn edges(&self) -> &[(u32, u32)] {
        &self.edges
    }
    pub fn features(&self) -> &[f32] {
        &self.features
    }

    /// Number of edge records incident to each node; a self-loop is one
    /// incident edge. Degrees supplied by the source take precedence.
    pub fn degrees(&self) -> Vec<usize> {
        if let Some(degrees) = &self.source_degrees {
            return degrees.clone();
        }
        let mut degree = vec![0; self.num_nodes()];
        for &(s, t) in &self.edges {
            degree[s as usize] += 1;
            if s != t {
                degree[t as usize] += 1;
            }
        }
        degree
    }

    /// Z-score normalised copy of the feature matrix. Constant columns are
    /// only centred.
    pub fn standardized_features(&self) -> Vec<f32> {
        let n = self.num_nodes().max(1) as f64;
        let f = self.num_features;
        let mut mean = vec![0.0f64; f];
        let mut var = vec![0.0f64; f];
        for row in self.features.chunks(f) {
            for (m, &x) in mean.iter_mut().zip(row) {
                *m += x as f64 / n;
            }
        }
        for row in self.features.chunks(f) {
            for ((v, m), &x) in var.iter_mut().zip(&mean).zip(row) {
                *v += (x as f64 - m).powi(2) / n;
            }
        }
        let std: Vec<f64> = var
            .into_iter()
            .map(|v| if v > 1e-12 { v.sqrt() } else { 1.0 })
            .collect();
        self.features
            .chunks(f)
            .flat_map(|row| {
                row.iter()
                    .zip(mean.iter().zip(&std))
                    .map(|(&x, (m, s))| ((x as f64 - m) / s) as f32)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// `(2, 2E)` message-passing index: every stored edge in both directions.
    pub fn message_edge_index(&self, device: &Device) -> candle_core::Result<Tensor> {
        let e = self.edges.len();
        let mut edge_index = Vec::with_capacity(4 * e);
        // source row: forward sources then reversed; target row mirrors it
        edge_index.extend(self.edges.iter().map(|&(s, _)| s));
        edge_index.extend(self.edges.iter().map(|&(_, t)| t));
        edge_index.extend(self.edges.iter().map(|&(_, t)| t));
        edge_index.extend(self.edges.iter().map(|&(s, _)| s));
        Tensor::from_vec(edge_index, (2, 2 * e), device)
    }
}

/// Device-resident view of a labelled, partitioned graph.
#[derive(Debug, Clone)]
pub struct GraphTensors {
    pub xs: Tensor,
    pub edge_index: Tensor,
    pub ys: Tensor,
    pub train_indices: Tensor,
    pub val_indices: Tensor,
    pub test_indices: Tensor,
    pub num_train: usize,
    pub num_val: usize,
    pub num_test: usize,
}
impl GraphTensors {
    pub fn new(
        graph: &TrailGraph,
        labels: &[TopologyClass],
        partition: &Partition,
        standardize: bool,
        device: &Device,
    ) -> Result<Self> {
        let n = graph.num_nodes();
        if labels.len() != n || partition.len() != n {
            return Err(Error::data_format(format!(
                "{n} nodes but {} labels and {} partition entries",
                labels.len(),
                partition.len()
            )));
        }
        let features = if standardize {
            graph.standardized_features()
        } else {
            graph.features().to_vec()
        };
        let xs = Tensor::from_vec(features, (n, graph.num_features()), device)?;
        let ys = Tensor::from_iter(labels.iter().map(|&c| c.index() as u32), device)?;
        let train = partition.indices(Split::Train);
        let val = partition.indices(Split::Val);
        let test = partition.indices(Split::Test);
        Ok(Self {
            xs,
            edge_index: graph.message_edge_index(device)?,
            ys,
            num_train: train.len(),
            num_val: val.len(),
            num_test: test.len(),
            train_indices: index_tensor(&train, device)?,
            val_indices: index_tensor(&val, device)?,
            test_indices: index_tensor(&test, device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_with_bad_edge() -> Vec<(i64, i64)> {
        let mut raw: Vec<(i64, i64)> = (0..9).map(|i| (i, i + 1)).collect();
        raw.push((0, 999));
        raw
    }

    #[test]
    fn out_of_range_edge_is_dropped_and_counted() {
        let checked = validate_edges(&path_with_bad_edge(), 10);
        assert_eq!(checked.dropped, 1);
        assert_eq!(checked.edges.len(), 9);
        assert_eq!(checked.edges[8], (8, 9));
    }

    #[test]
    fn negative_endpoints_are_dropped() {
        let checked = validate_edges(&[(-1, 2), (2, -5), (1, 2)], 3);
        assert_eq!(checked.edges, vec![(1, 2)]);
        assert_eq!(checked.dropped, 2);
    }

    #[test]
    fn edge_filtering_is_idempotent() {
        let once = validate_edges(&path_with_bad_edge(), 10);
        let raw: Vec<(i64, i64)> = once.edges.iter().map(|&(s, t)| (s as i64, t as i64)).collect();
        let twice = validate_edges(&raw, 10);
        assert_eq!(twice.edges, once.edges);
        assert_eq!(twice.dropped, 0);
    }

    #[test]
    fn degrees_count_both_endpoints() {
        let graph =
            TrailGraph::from_rows(vec![vec![0.0]; 4], vec![(0, 1), (1, 2), (1, 3)]).unwrap();
        assert_eq!(graph.degrees(), vec![1, 3, 1, 1]);
    }

    #[test]
    fn self_loop_is_one_incident_edge() {
        let graph = TrailGraph::from_rows(vec![vec![0.0]; 3], vec![(0, 0), (1, 2)]).unwrap();
        assert_eq!(graph.degrees(), vec![1, 1, 1]);
    }

    #[test]
    fn source_degrees_override_edge_counts() {
        let graph = TrailGraph::from_rows(vec![vec![0.0]; 3], vec![(0, 1)])
            .unwrap()
            .with_source_degrees(vec![2, 1, 4])
            .unwrap();
        assert_eq!(graph.degrees(), vec![2, 1, 4]);
        let graph = TrailGraph::from_rows(vec![vec![0.0]; 3], vec![(0, 1)]).unwrap();
        assert!(graph.with_source_degrees(vec![1]).is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = TrailGraph::from_rows(vec![vec![0.0, 1.0], vec![2.0]], vec![]).unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn message_edges_are_symmetric() {
        let graph = TrailGraph::from_rows(vec![vec![0.0]; 3], vec![(0, 1), (1, 2)]).unwrap();
        let index = graph
            .message_edge_index(&Device::Cpu)
            .unwrap()
            .to_vec2::<u32>()
            .unwrap();
        assert_eq!(index[0], vec![0, 1, 1, 2]);
        assert_eq!(index[1], vec![1, 2, 0, 1]);
    }

    #[test]
    fn standardized_columns_have_zero_mean() {
        let graph = TrailGraph::from_rows(
            vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0]],
            vec![(0, 1)],
        )
        .unwrap();
        let xs = graph.standardized_features();
        let col0: f32 = xs.iter().step_by(2).sum();
        assert!(col0.abs() < 1e-5);
        assert!(xs.iter().skip(1).step_by(2).all(|&x| x == 0.0));
    }
}
