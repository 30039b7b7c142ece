use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
    /// Explicitly out-of-sample; only produced by supplied masks.
    Unassigned,
}

/// Where the train/val/test assignment comes from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Supplied masks when the source has them, a random split otherwise.
    #[default]
    Auto,
    Supplied,
    Random,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}
impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.70,
            val: 0.15,
            test: 0.15,
        }
    }
}
impl SplitRatios {
    pub fn validate(&self) -> Result<()> {
        let parts = [self.train, self.val, self.test];
        if parts.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(Error::Config(format!("split ratios must be non-negative: {self:?}")));
        }
        if parts.iter().sum::<f64>() > 1.0 + 1e-9 {
            return Err(Error::Config(format!("split ratios sum above 1.0: {self:?}")));
        }
        Ok(())
    }
}

/// One split tag per node; the train/val/test masks are disjoint by
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    splits: Vec<Split>,
}
impl Partition {
    pub fn new(splits: Vec<Split>) -> Self {
        Self { splits }
    }

    /// Combines three boolean masks. Overlapping membership is rejected;
    /// nodes in none of them become [`Split::Unassigned`].
    pub fn from_masks(train: &[bool], val: &[bool], test: &[bool]) -> Result<Self> {
        if train.len() != val.len() || train.len() != test.len() {
            return Err(Error::data_format(format!(
                "mask lengths differ: train={} val={} test={}",
                train.len(),
                val.len(),
                test.len()
            )));
        }
        let splits = itertools::izip!(train, val, test)
            .enumerate()
            .map(|(node, (&tr, &va, &te))| match (tr, va, te) {
                (true, false, false) => Ok(Split::Train),
                (false, true, false) => Ok(Split::Val),
                (false, false, true) => Ok(Split::Test),
                (false, false, false) => Ok(Split::Unassigned),
                _ => Err(Error::data_format(format!(
                    "node {node} belongs to more than one partition"
                ))),
            })
            .collect::<Result<_>>()?;
        Ok(Self { splits })
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
    pub fn get(&self, node: usize) -> Split {
        self.splits[node]
    }
    pub fn mask(&self, split: Split) -> Vec<bool> {
        self.splits.iter().map(|&s| s == split).collect()
    }
    pub fn indices(&self, split: Split) -> Vec<u32> {
        self.splits
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| (s == split).then_some(i as u32))
            .collect()
    }
    pub fn count(&self, split: Split) -> usize {
        self.splits.iter().filter(|&&s| s == split).count()
    }
}

/// Shuffles `0..node_count` and slices the permutation into train, val and
/// test ranges of `floor(ratio * node_count)` nodes; the remainder goes to
/// test.
pub fn random_split(
    node_count: usize,
    ratios: SplitRatios,
    seed: Option<u64>,
) -> Result<Partition> {
    ratios.validate()?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut order: Vec<usize> = (0..node_count).collect();
    order.shuffle(&mut rng);

    let n_train = (ratios.train * node_count as f64).floor() as usize;
    let n_val = (ratios.val * node_count as f64).floor() as usize;
    let n_val = n_val.min(node_count - n_train);

    let mut splits = vec![Split::Test; node_count];
    for &node in &order[..n_train] {
        splits[node] = Split::Train;
    }
    for &node in &order[n_train..n_train + n_val] {
        splits[node] = Split::Val;
    }
    Ok(Partition { splits })
}
