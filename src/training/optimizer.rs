//! Optimizers
//!
//! candle-nn's AdamW and SGD behind one type, and a per-slot gradient report
//! used to skip updates with a non-finite gradient.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::optim::{AdamW, Optimizer as CandleOptimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::{Result, SymbolicError};

/// Which optimizer a [`crate::training::Trainer`] builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// The optimizer stepping every trainable variable of a model
pub enum Optimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl Optimizer {
    /// Build the optimizer named by `kind`
    ///
    /// Adam with `weight_decay = 0` is plain Adam. SGD ignores `weight_decay`.
    pub fn new(
        kind: OptimizerKind,
        vars: Vec<Var>,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        match kind {
            OptimizerKind::Adam => {
                let params = ParamsAdamW {
                    lr: learning_rate,
                    weight_decay,
                    ..Default::default()
                };
                <AdamW as CandleOptimizer>::new(vars, params)
                    .map(Self::Adam)
                    .map_err(|e| SymbolicError::Training(format!("AdamW init failed: {}", e)))
            }
            OptimizerKind::Sgd => <SGD as CandleOptimizer>::new(vars, learning_rate)
                .map(Self::Sgd)
                .map_err(|e| SymbolicError::Training(format!("SGD init failed: {}", e))),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Adam(_) => OptimizerKind::Adam,
            Self::Sgd(_) => OptimizerKind::Sgd,
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let kind = self.kind();
        let result = match self {
            Self::Adam(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        };
        result.map_err(|e| SymbolicError::Training(format!("{:?} step failed: {}", kind, e)))
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

// =============================================================================
// Gradient Report
// =============================================================================

/// Global gradient norm and the slots whose gradient is not finite
#[derive(Debug, Clone, PartialEq)]
pub struct GradientReport {
    pub norm: f64,
    /// Names of the slots holding a NaN or an infinity, in model order
    pub non_finite: Vec<String>,
}

impl GradientReport {
    /// Inspect the gradients of named variables
    ///
    /// Squares are summed in f64, where an f32 gradient cannot overflow, so a
    /// slot's squared norm is finite exactly when all its entries are.
    /// Variables without a gradient are skipped.
    pub fn inspect(grads: &GradStore, vars: &[(String, Var)]) -> Result<Self> {
        let mut total = 0.0f64;
        let mut non_finite = Vec::new();
        for (name, var) in vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let squared = grad
                .to_dtype(DType::F64)
                .and_then(|t| t.sqr())
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_scalar::<f64>())
                .map_err(|e| SymbolicError::Tensor(format!("grad norm of {} failed: {}", name, e)))?;
            if !squared.is_finite() {
                non_finite.push(name.clone());
            }
            total += squared;
        }
        Ok(Self {
            norm: total.sqrt(),
            non_finite,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.non_finite.is_empty()
    }
}
