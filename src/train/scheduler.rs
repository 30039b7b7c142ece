use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauParams {
    /// Multiplier applied to the learning rate on a plateau.
    pub factor: f64,
    /// Validation checks without improvement tolerated before reducing.
    pub patience: usize,
    pub min_lr: f64,
    /// Relative improvement needed to count as progress.
    pub threshold: f64,
}
impl Default for PlateauParams {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 2,
            min_lr: 1e-5,
            threshold: 1e-4,
        }
    }
}

/// Lowers the learning rate when the training loss stops decreasing.
#[derive(Clone, Debug)]
pub struct ReduceOnPlateau {
    params: PlateauParams,
    best: Option<f32>,
    bad_checks: usize,
}
impl ReduceOnPlateau {
    pub fn new(params: PlateauParams) -> Self {
        Self {
            params,
            best: None,
            bad_checks: 0,
        }
    }

    /// Returns the new learning rate when a reduction is due.
    pub fn step(&mut self, loss: f32, lr: f64) -> Option<f64> {
        let improved = self
            .best
            .map_or(true, |best| (loss as f64) < best as f64 * (1.0 - self.params.threshold));
        if improved {
            self.best = Some(loss);
            self.bad_checks = 0;
            return None;
        }
        self.bad_checks += 1;
        if self.bad_checks <= self.params.patience {
            return None;
        }
        self.bad_checks = 0;
        let reduced = (lr * self.params.factor).max(self.params.min_lr);
        (reduced < lr).then_some(reduced)
    }
}
