use serde::{Deserialize, Serialize};

use super::graph::{TopologyClass, TrailGraph};

/// Where node labels come from when a run starts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Supplied labels when the source has them, degree-derived otherwise.
    #[default]
    Auto,
    Supplied,
    Derived,
}

pub fn degree_label(degree: usize) -> TopologyClass {
    match degree {
        2 => TopologyClass::MergeDegree2,
        d if d >= 4 => TopologyClass::SplitYT,
        _ => TopologyClass::Keep,
    }
}

/// Topology-derived fallback labels.
pub fn derive_labels(graph: &TrailGraph) -> Vec<TopologyClass> {
    graph.degrees().into_iter().map(degree_label).collect()
}
