//! Edge-triggered threshold detection
//!
//! Shared by engines (`<namespace>:high`) and the aggregator
//! (`<namespace>:transcendent`).

use serde::Serialize;

/// Fires once per upward crossing of `threshold`
///
/// A value strictly above the threshold counts as "above". The trigger
/// re-arms only after a value at or below the threshold is observed.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeTrigger {
    threshold: f64,
    above: bool,
    crossings: u64,
}

impl EdgeTrigger {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            above: false,
            crossings: 0,
        }
    }

    /// Observe a value; true exactly when it crosses upward
    pub fn update(&mut self, value: f64) -> bool {
        let above = value > self.threshold;
        let crossed = above && !self.above;
        self.above = above;
        if crossed {
            self.crossings += 1;
        }
        crossed
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_above(&self) -> bool {
        self.above
    }

    /// Upward crossings seen so far
    pub fn crossings(&self) -> u64 {
        self.crossings
    }

    /// Re-arm without forgetting the crossing count
    pub fn reset(&mut self) {
        self.above = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_crossing() {
        let mut trigger = EdgeTrigger::new(0.95);
        let fired: Vec<bool> = [0.5, 0.96, 0.97, 0.99, 0.9, 0.96, 0.98]
            .iter()
            .map(|v| trigger.update(*v))
            .collect();
        assert_eq!(fired, vec![false, true, false, false, false, true, false]);
        assert_eq!(trigger.crossings(), 2);
    }

    #[test]
    fn test_equal_to_threshold_is_not_above() {
        let mut trigger = EdgeTrigger::new(0.9);
        assert!(!trigger.update(0.9));
        assert!(trigger.update(0.91));
        assert!(!trigger.update(0.9));
        assert!(!trigger.is_above());
        assert!(trigger.update(0.91));
    }

    #[test]
    fn test_first_value_above_fires() {
        let mut trigger = EdgeTrigger::new(0.5);
        assert!(trigger.update(1.0));
    }

    #[test]
    fn test_reset_rearms() {
        let mut trigger = EdgeTrigger::new(0.5);
        trigger.update(0.8);
        trigger.reset();
        assert!(trigger.update(0.8));
    }
}
