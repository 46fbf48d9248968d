//! Epoch Callbacks
//!
//! Both callbacks watch one value per epoch (the mean regression loss) and
//! treat it as improved when it drops below `best - min_delta`. A NaN never
//! improves.

use serde::{Deserialize, Serialize};

fn improved(current: f64, best: f64, min_delta: f64) -> bool {
    current < best - min_delta
}

/// Settings for [`ReduceLrOnPlateau`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau
    pub factor: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 3,
            min_delta: 1e-2,
            min_lr: 1e-7,
        }
    }
}

/// Lower the learning rate when the monitored value stops improving
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: PlateauConfig) -> Self {
        Self {
            config,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Record an epoch, returning the new learning rate if it should change
    pub fn observe(&mut self, value: f64, learning_rate: f64) -> Option<f64> {
        if improved(value, self.best, self.config.min_delta) {
            self.best = value;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.config.patience || learning_rate <= self.config.min_lr {
            return None;
        }
        self.wait = 0;
        Some((learning_rate * self.config.factor).max(self.config.min_lr))
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// Settings for [`EarlyStopping`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 7,
            min_delta: 1e-2,
        }
    }
}

/// Stop training after `patience` epochs without improvement
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best: f64,
    wait: usize,
    epochs_seen: usize,
}

impl EarlyStopping {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        Self {
            config,
            best: f64::INFINITY,
            wait: 0,
            epochs_seen: 0,
        }
    }

    /// Record an epoch, returning true when training should stop
    pub fn observe(&mut self, value: f64) -> bool {
        self.epochs_seen += 1;
        self.wait += 1;
        if improved(value, self.best, self.config.min_delta) {
            self.best = value;
            self.wait = 0;
        }
        // never stop after the first epoch
        self.wait >= self.config.patience && self.epochs_seen > 1
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}
