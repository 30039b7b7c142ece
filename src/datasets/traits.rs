use serde::{Deserialize, Serialize};

use super::graph::{TopologyClass, TrailGraph};
use super::split::Partition;
use crate::error::Result;

/// Counts recorded by whoever produced an export. Used only to cross-check
/// the data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub num_nodes: Option<usize>,
    pub num_edges: Option<usize>,
    pub num_features: Option<usize>,
    pub num_classes: Option<usize>,
}

/// Output of a single load: the validated graph plus whatever supervision the
/// source carried.
#[derive(Clone, Debug)]
pub struct LoadedGraph {
    pub graph: TrailGraph,
    pub labels: Option<Vec<TopologyClass>>,
    pub partition: Option<Partition>,
    pub dropped_edges: usize,
    pub metadata: ExportMetadata,
}

pub trait GraphLoader {
    /// Human-readable description of the source, used in logs.
    fn describe(&self) -> String;
    fn load(&self) -> Result<LoadedGraph>;
}
