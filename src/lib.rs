//! # neural-sr
//!
//! Sparsity-regularized symbolic regression networks that learn to tell
//! executable file fragments apart from other content, and collapse into
//! closed-form expressions once trained.
//!
//! ## Overview
//!
//! A network is assembled from an input-sparsity layer, a stack of symbolic
//! layers and a sigmoid head. Every weight, bias, input feature and operator
//! slot carries a trainable threshold. A hard step function with a smooth
//! surrogate gradient turns `magnitude - threshold` into a keep/drop mask, so
//! the network learns both the task and which parts of itself it needs.
//!
//! - **Primitives**: masking step function, activations, losses, device selection
//! - **Model**: operator vocabulary, evaluation algebra, layers, assembly, checkpoints
//! - **Training**: sparsity-regularized training step, metrics, epoch driver
//! - **Symbolic**: expression type and post-training extraction
//! - **Data**: bit-vector ingestion, synthetic positives, dataset cache
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use neural_sr::prelude::*;
//!
//! let config = ModelConfig::new(512, 1)
//!     .with_hidden(HiddenLayerSpec::new(
//!         OperatorMenu::new(vec![UnaryOp::Sin, UnaryOp::Exp], vec![BinaryOp::Add]),
//!         10,
//!         5,
//!     ));
//! let model = SymbolicModel::new(config, &best_device())?;
//! let mut trainer = Trainer::new(model, SparsityTargets::default(), &TrainingConfig::default())?;
//!
//! let history = trainer.fit(&train_set, &TrainingConfig::default())?;
//! let extraction = extract_expressions(trainer.model(), &ExtractConfig::default())?;
//! for (i, expr) in extraction.expressions.iter().enumerate() {
//!     println!("expr_{} (complexity = {}): {}", i, extraction.complexity[i], expr);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod config;
pub mod data;
pub mod model;
pub mod primitives;
pub mod symbolic;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for symbolic regression operations
#[derive(Debug, thiserror::Error)]
pub enum SymbolicError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for symbolic regression operations
pub type Result<T> = std::result::Result<T, SymbolicError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{Result, SymbolicError};

    // Primitives
    pub use crate::primitives::{
        best_device, binary_cross_entropy, cpu_device, gpu_disabled, sigmoid, step_mask,
        StepFunction, SurrogateGradient, DEFAULT_STEEPNESS,
    };

    // Model
    pub use crate::model::{
        BinaryOp, HiddenLayerSpec, ModelConfig, OperatorMenu, ParamSlot, SymbolicModel, UnaryOp,
    };

    // Training
    pub use crate::training::{
        FitHistory, SparsityStats, SparsityTargets, StepMetrics, Trainer, TrainingConfig,
        TrainingMetrics,
    };

    // Symbolic extraction
    pub use crate::symbolic::{extract_expressions, Expr, ExtractConfig, Extraction};

    // Data
    pub use crate::data::{Dataset, FeatureVector};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = best_device();
        assert!(
            matches!(device, Device::Cpu)
                || matches!(device, Device::Metal(_))
                || matches!(device, Device::Cuda(_))
        );
    }

    #[test]
    fn test_error_display() {
        let err = crate::SymbolicError::Config("hidden layer 0 has no unary units".into());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: hidden layer 0 has no unary units"
        );
    }
}
