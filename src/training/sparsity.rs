//! Sparsity Statistics
//!
//! Slot counts per weight group, read from the live parameter tensors.
//!
//! | Group   | Slots                               | Magnitude    |
//! |---------|-------------------------------------|--------------|
//! | input   | one per input feature               | reference 1  |
//! | model   | every weight and bias of every layer | `|w|`, `|b|` |
//! | unary   | one per hidden unary unit           | reference 1  |
//! | binary  | one per hidden binary unit          | reference 1  |
//!
//! A slot is pruned when `magnitude - threshold <= 0`, the same comparison the
//! forward masks make.

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::model::SymbolicModel;
use crate::primitives::values_f64;
use crate::Result;

/// Exponent `d` of the decay factor
pub const DECAY_EXPONENT: f64 = 0.01;

/// Regularization strength for a group at `sparsity` aiming for `target`
///
/// `exp(1 - (target / (target - min(sparsity, target)))^d)`: 1 when nothing
/// is pruned, falling towards 0 as the target approaches, and exactly 0 once
/// it is reached.
pub fn decay_factor(sparsity: f64, target: f64) -> f64 {
    if sparsity >= target {
        return 0.0;
    }
    let ratio = target / (target - sparsity);
    (1.0 - ratio.powf(DECAY_EXPONENT)).exp()
}

/// Counts and sums over the slots of one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub pruned: usize,
    pub total: usize,
    pub threshold_sum: f64,
    pub magnitude_sum: f64,
}

impl GroupStats {
    /// Add slots given their magnitudes and thresholds
    pub fn absorb(&mut self, magnitudes: &[f64], thresholds: &[f64]) {
        for (m, t) in magnitudes.iter().zip(thresholds.iter()) {
            if m - t <= 0.0 {
                self.pruned += 1;
            }
            self.threshold_sum += t;
            self.magnitude_sum += m;
        }
        self.total += magnitudes.len().min(thresholds.len());
    }

    /// Add slots of a tensor compared by absolute value
    fn absorb_abs(&mut self, values: &Tensor, thresholds: &Tensor) -> Result<()> {
        let magnitudes: Vec<f64> = values_f64(values)?.into_iter().map(f64::abs).collect();
        self.absorb(&magnitudes, &values_f64(thresholds)?);
        Ok(())
    }

    /// Add slots of a tensor compared against a fixed reference
    fn absorb_reference(&mut self, reference: &Tensor, thresholds: &Tensor) -> Result<()> {
        self.absorb(&values_f64(reference)?, &values_f64(thresholds)?);
        Ok(())
    }

    /// Fraction of pruned slots, 0 for an empty group
    pub fn sparsity(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.pruned as f64 / self.total as f64
    }

    pub fn threshold_mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.threshold_sum / self.total as f64
    }

    pub fn weight_mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.magnitude_sum / self.total as f64
    }
}

/// Statistics of all four groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityStats {
    pub input: GroupStats,
    pub model: GroupStats,
    pub unary: GroupStats,
    pub binary: GroupStats,
}

impl SparsityStats {
    /// Recount every group from the current parameter values
    pub fn from_model(model: &SymbolicModel) -> Result<Self> {
        let mut stats = Self::default();

        let input = model.input_sparsity();
        stats
            .input
            .absorb_reference(&input.reference, input.threshold.as_tensor())?;

        for layer in model.layers() {
            let params = layer.params();
            stats
                .model
                .absorb_abs(params.weight.as_tensor(), params.weight_threshold.as_tensor())?;
            stats
                .model
                .absorb_abs(params.bias.as_tensor(), params.bias_threshold.as_tensor())?;

            if let (Some(reference), Some(threshold)) = (&params.unary_ref, &params.unary_threshold) {
                stats.unary.absorb_reference(reference, threshold.as_tensor())?;
            }
            if let (Some(reference), Some(threshold)) = (&params.binary_ref, &params.binary_threshold)
            {
                stats.binary.absorb_reference(reference, threshold.as_tensor())?;
            }
        }

        Ok(stats)
    }

    /// `[input, model, unary, binary]` sparsity fractions
    pub fn fractions(&self) -> [f64; 4] {
        [
            self.input.sparsity(),
            self.model.sparsity(),
            self.unary.sparsity(),
            self.binary.sparsity(),
        ]
    }
}

impl fmt::Display for SparsityStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input sparsity = {:.3}; model sparsity = {:.3}; unary sparsity = {:.3}; binary sparsity = {:.3}",
            self.input.sparsity(),
            self.model.sparsity(),
            self.unary.sparsity(),
            self.binary.sparsity()
        )
    }
}
