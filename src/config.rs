//! Experiment configuration
//!
//! Everything a training run needs in one serde value, read from and written
//! to JSON. Missing sections fall back to their defaults, so a file only has
//! to mention what it changes:
//!
//! ```json
//! {
//!   "model": {
//!     "input_dim": 512,
//!     "output_dim": 1,
//!     "hidden": [
//!       { "menu": { "unary": ["sin", "exp"], "binary": ["add"] }, "num_unary": 10, "num_binary": 5 }
//!     ]
//!   },
//!   "training": { "epochs": 10 },
//!   "data": { "data_path": "/data/fragments", "data_points": 20000 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use crate::data::DataConfig;
use crate::model::ModelConfig;
use crate::training::{SparsityTargets, TrainingConfig};
use crate::{Result, SymbolicError};

/// Model, training, sparsity and data settings of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub targets: SparsityTargets,
    pub data: DataConfig,
}

impl ExperimentConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SymbolicError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SymbolicError::Serialization(e.to_string()))
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(SymbolicError::Io)?;
        let config = Self::from_json(&content)?;
        config.validate()?;
        debug!("Loaded experiment config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?).map_err(SymbolicError::Io)
    }

    /// Check that the sections agree with each other and are usable
    pub fn validate(&self) -> Result<()> {
        self.model.validate_strict()?;

        if self.model.input_dim != self.data.word_length {
            return Err(SymbolicError::Config(format!(
                "model input_dim {} differs from data word_length {}",
                self.model.input_dim, self.data.word_length
            )));
        }
        if !(0.0..1.0).contains(&self.data.test_fraction) {
            return Err(SymbolicError::Config(format!(
                "test_fraction {} must be in [0, 1)",
                self.data.test_fraction
            )));
        }
        if self.training.batch_size == 0 {
            return Err(SymbolicError::Config("batch_size must be non-zero".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(SymbolicError::Config(format!(
                "learning_rate {} must be positive",
                self.training.learning_rate
            )));
        }
        for (name, target) in [
            ("input", self.targets.input),
            ("model", self.targets.model),
            ("unary", self.targets.unary),
            ("binary", self.targets.binary),
        ] {
            if !(target > 0.0 && target <= 1.0) {
                return Err(SymbolicError::Config(format!(
                    "{} sparsity target {} must be in (0, 1]",
                    name, target
                )));
            }
        }
        Ok(())
    }
}
