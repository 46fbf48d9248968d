//! Training Metrics
//!
//! [`StepMetrics`] is what one training step reports. [`TrainingMetrics`]
//! keeps running means over the steps of an epoch and is owned by whoever
//! drives the loop.

use serde::{Deserialize, Serialize};

/// Per-group values of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMetrics {
    /// Regularization term added to the loss
    pub reg_loss: f64,
    pub threshold_mean: f64,
    /// Mean magnitude of the slots (always 1 for reference-gated groups)
    pub weight_mean: f64,
    pub sparsity: f64,
}

impl GroupMetrics {
    fn scaled_add(&mut self, other: &GroupMetrics, scale: f64) {
        self.reg_loss += other.reg_loss * scale;
        self.threshold_mean += other.threshold_mean * scale;
        self.weight_mean += other.weight_mean * scale;
        self.sparsity += other.sparsity * scale;
    }
}

/// Result of one training step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Base loss plus all regularization terms
    pub total_loss: f64,
    /// Binary cross-entropy
    pub regression_loss: f64,
    pub input: GroupMetrics,
    pub model: GroupMetrics,
    pub unary: GroupMetrics,
    pub binary: GroupMetrics,
    pub correct: usize,
    pub samples: usize,
    /// L2 norm of all gradients
    pub grad_norm: f64,
    /// Whether the update was skipped because of non-finite gradients
    pub skipped: bool,
}

impl StepMetrics {
    /// Fraction of rounded predictions matching the labels
    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }

    pub fn is_finite(&self) -> bool {
        self.total_loss.is_finite() && self.regression_loss.is_finite()
    }
}

/// Running means over training steps
#[derive(Debug, Clone, Default)]
pub struct TrainingMetrics {
    sums: StepMetrics,
    steps: usize,
    skipped: usize,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one step
    pub fn update(&mut self, step: &StepMetrics) {
        self.sums.total_loss += step.total_loss;
        self.sums.regression_loss += step.regression_loss;
        self.sums.input.scaled_add(&step.input, 1.0);
        self.sums.model.scaled_add(&step.model, 1.0);
        self.sums.unary.scaled_add(&step.unary, 1.0);
        self.sums.binary.scaled_add(&step.binary, 1.0);
        self.sums.grad_norm += step.grad_norm;
        self.sums.correct += step.correct;
        self.sums.samples += step.samples;
        if step.skipped {
            self.skipped += 1;
        }
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Steps whose update was skipped
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Means of every value since the last reset
    ///
    /// Accuracy is pooled over samples (`correct` and `samples` are summed).
    /// `None` before the first step.
    pub fn result(&self) -> Option<StepMetrics> {
        if self.steps == 0 {
            return None;
        }
        let scale = 1.0 / self.steps as f64;
        let mut mean = StepMetrics {
            total_loss: self.sums.total_loss * scale,
            regression_loss: self.sums.regression_loss * scale,
            correct: self.sums.correct,
            samples: self.sums.samples,
            grad_norm: self.sums.grad_norm * scale,
            skipped: self.skipped > 0,
            ..Default::default()
        };
        mean.input.scaled_add(&self.sums.input, scale);
        mean.model.scaled_add(&self.sums.model, scale);
        mean.unary.scaled_add(&self.sums.unary, scale);
        mean.binary.scaled_add(&self.sums.binary, scale);
        Some(mean)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(loss: f64, correct: usize, samples: usize) -> StepMetrics {
        StepMetrics {
            total_loss: loss * 2.0,
            regression_loss: loss,
            model: GroupMetrics {
                sparsity: loss,
                ..Default::default()
            },
            correct,
            samples,
            ..Default::default()
        }
    }

    #[test]
    fn test_running_means() {
        let mut metrics = TrainingMetrics::new();
        assert!(metrics.result().is_none());

        metrics.update(&step(1.0, 3, 4));
        metrics.update(&step(0.5, 1, 4));

        let mean = metrics.result().unwrap();
        assert_eq!(metrics.steps(), 2);
        assert!((mean.regression_loss - 0.75).abs() < 1e-12);
        assert!((mean.total_loss - 1.5).abs() < 1e-12);
        assert!((mean.model.sparsity - 0.75).abs() < 1e-12);
        assert!((mean.accuracy() - 0.5).abs() < 1e-12);
        assert!(!mean.skipped);
    }

    #[test]
    fn test_reset() {
        let mut metrics = TrainingMetrics::new();
        let mut skipped = step(f64::NAN, 0, 2);
        skipped.skipped = true;
        metrics.update(&skipped);
        assert_eq!(metrics.skipped(), 1);
        assert!(!metrics.result().unwrap().is_finite());

        metrics.reset();
        assert_eq!(metrics.steps(), 0);
        assert_eq!(metrics.skipped(), 0);
        assert!(metrics.result().is_none());
    }

    #[test]
    fn test_accuracy_without_samples() {
        assert_eq!(StepMetrics::default().accuracy(), 0.0);
    }
}
