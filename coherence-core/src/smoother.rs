//! Metric smoothing
//!
//! Turns a noisy raw scalar into a stable published value.
//!
//! - [`MovingAverage`]: trailing mean over the last `capacity` samples
//! - [`ExponentialSmoother`]: weighted blend of the new sample and the
//!   previous output (`alpha * new + (1 - alpha) * previous`)

use std::collections::VecDeque;

use crate::error::{Result, SyncError};

/// Common interface so sources can take either smoother
pub trait Smoother: Send {
    /// Feed a raw value, returning the smoothed value
    fn push(&mut self, value: f64) -> f64;

    /// Last smoothed value, if any sample has been pushed
    fn current(&self) -> Option<f64>;

    /// Forget all samples
    fn reset(&mut self);
}

/// Fixed-window trailing moving average
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<f64>,
    capacity: usize,
}

impl MovingAverage {
    /// Create an averager over the last `capacity` samples (must be ≥ 1)
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SyncError::invalid("smoother capacity must be at least 1"));
        }
        Ok(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Mean anchored on the oldest sample so a constant window is exact
    fn mean(&self) -> Option<f64> {
        let anchor = *self.window.front()?;
        let offset: f64 = self.window.iter().map(|v| v - anchor).sum();
        Some(anchor + offset / self.window.len() as f64)
    }
}

impl Smoother for MovingAverage {
    fn push(&mut self, value: f64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        // window is non-empty after the push
        self.mean().unwrap_or(value)
    }

    fn current(&self) -> Option<f64> {
        self.mean()
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Exponential moving average
///
/// The first sample passes through unchanged.
#[derive(Debug, Clone)]
pub struct ExponentialSmoother {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialSmoother {
    /// `alpha` is the weight of the newest sample, in (0, 1]
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(SyncError::invalid(format!(
                "smoothing factor must be in (0, 1], got {}",
                alpha
            )));
        }
        Ok(Self { alpha, value: None })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Smoother for ExponentialSmoother {
    fn push(&mut self, value: f64) -> f64 {
        let next = match self.value {
            Some(previous) => previous + self.alpha * (value - previous),
            None => value,
        };
        self.value = Some(next);
        next
    }

    fn current(&self) -> Option<f64> {
        self.value
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(MovingAverage::new(0).is_err());
    }

    #[test]
    fn test_partial_window_mean() {
        let mut avg = MovingAverage::new(4).unwrap();
        assert_eq!(avg.push(1.0), 1.0);
        assert_eq!(avg.push(3.0), 2.0);
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut avg = MovingAverage::new(2).unwrap();
        avg.push(10.0);
        avg.push(20.0);
        assert_eq!(avg.push(30.0), 25.0);
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_constant_input_is_exact() {
        for &c in &[0.1, 0.7, 1.0 / 3.0, 0.30000000000000004, 123.456] {
            for capacity in 1..8 {
                let mut avg = MovingAverage::new(capacity).unwrap();
                avg.push(0.9);
                avg.push(-4.0);
                let mut last = 0.0;
                for _ in 0..capacity {
                    last = avg.push(c);
                }
                assert_eq!(last, c, "capacity {} constant {}", capacity, c);
            }
        }
    }

    #[test]
    fn test_reset() {
        let mut avg = MovingAverage::new(3).unwrap();
        avg.push(1.0);
        avg.reset();
        assert!(avg.is_empty());
        assert_eq!(avg.current(), None);
    }

    #[test]
    fn test_exponential_blend() {
        let mut ema = ExponentialSmoother::new(0.25).unwrap();
        assert_eq!(ema.push(0.8), 0.8);
        let blended = ema.push(0.4);
        assert!((blended - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_rejects_bad_alpha() {
        assert!(ExponentialSmoother::new(0.0).is_err());
        assert!(ExponentialSmoother::new(1.5).is_err());
        assert!(ExponentialSmoother::new(f64::NAN).is_err());
        assert!(ExponentialSmoother::new(1.0).is_ok());
    }
}
