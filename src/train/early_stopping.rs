/// Tracks the best validation score and signals a stop once `patience`
/// consecutive checks fail to beat it.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f32>,
    checks_since_best: usize,
}
impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            checks_since_best: 0,
        }
    }

    /// Records one validation result; returns `true` when training should
    /// stop.
    pub fn observe(&mut self, score: f32) -> bool {
        if self.best.map_or(true, |best| score > best) {
            self.best = Some(score);
            self.checks_since_best = 0;
            false
        } else {
            self.checks_since_best += 1;
            self.checks_since_best >= self.patience
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }
    pub fn checks_since_best(&self) -> usize {
        self.checks_since_best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_flat_checks() {
        let mut stopping = EarlyStopping::new(3);
        assert!(!stopping.observe(0.5));
        assert!(!stopping.observe(0.5));
        assert!(!stopping.observe(0.4));
        assert!(stopping.observe(0.5));
        assert_eq!(stopping.best(), Some(0.5));
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut stopping = EarlyStopping::new(2);
        stopping.observe(0.5);
        stopping.observe(0.4);
        assert!(!stopping.observe(0.6));
        assert_eq!(stopping.checks_since_best(), 0);
        assert!(!stopping.observe(0.6));
        assert!(stopping.observe(0.1));
    }

    #[test]
    fn never_waits_longer_than_patience() {
        let scores = [0.1, 0.3, 0.2, 0.3, 0.25, 0.2, 0.9, 0.9];
        let mut stopping = EarlyStopping::new(4);
        let stop_at = scores.iter().position(|&s| stopping.observe(s)).unwrap();
        // best 0.3 at index 1, four non-improving checks follow
        assert_eq!(stop_at, 5);
    }
}
