//! Training Infrastructure
//!
//! The sparsity-regularized training step and the epoch driver around it.
//!
//! ## Loss
//!
//! ```text
//! base  = BCE(labels, sigmoid(logits))                       (f64)
//! reg_g = base · exp(-mean(threshold_g)) · decay(sparsity_g, target_g)
//! total = base + reg_input + reg_model + reg_unary + reg_binary
//! ```
//!
//! Threshold means are differentiable, so every threshold receives a gradient
//! pushing it up. Sparsities are slot counts and only scale the terms; once a
//! group reaches its target its term vanishes.
//!
//! ## Example
//!
//! ```ignore
//! use neural_sr::training::*;
//!
//! let mut trainer = Trainer::new(model, SparsityTargets::default(), &config)?;
//! let mut metrics = TrainingMetrics::new();
//! for batch in dataset.batches(32, None)? {
//!     let step = trainer.train_step(&batch.features, &batch.labels)?;
//!     metrics.update(&step);
//! }
//! ```

mod callbacks;
mod metrics;
mod optimizer;
mod sparsity;

pub use callbacks::{EarlyStopping, EarlyStoppingConfig, PlateauConfig, ReduceLrOnPlateau};
pub use metrics::{GroupMetrics, StepMetrics, TrainingMetrics};
pub use optimizer::{GradientReport, Optimizer, OptimizerKind};
pub use sparsity::{decay_factor, GroupStats, SparsityStats, DECAY_EXPONENT};

use candle_core::{DType, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::Dataset;
use crate::model::checkpoint::named_vars;
use crate::model::SymbolicModel;
use crate::primitives::{binary_cross_entropy_f64, count_correct, scalar_f64, sigmoid};
use crate::{Result, SymbolicError};

// =============================================================================
// Configuration
// =============================================================================

/// Sparsity each group is pushed towards
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparsityTargets {
    pub input: f64,
    pub model: f64,
    pub unary: f64,
    pub binary: f64,
}

impl Default for SparsityTargets {
    fn default() -> Self {
        Self {
            input: 0.8,
            model: 0.99,
            unary: 0.8,
            binary: 0.9,
        }
    }
}

/// Configuration for training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub optimizer: OptimizerKind,
    /// Decoupled weight decay for Adam (0 = plain Adam)
    pub weight_decay: f64,
    /// Reshuffle batches every epoch
    pub shuffle: bool,
    pub seed: u64,
    pub plateau: PlateauConfig,
    pub early_stopping: EarlyStoppingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-3,
            batch_size: 32,
            epochs: 25,
            optimizer: OptimizerKind::Adam,
            weight_decay: 0.0,
            shuffle: true,
            seed: 42,
            plateau: PlateauConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
        }
    }
}

// =============================================================================
// Loss
// =============================================================================

/// Every component of the training loss for one batch
///
/// All loss tensors are f64 scalars attached to the autograd graph.
#[derive(Debug)]
pub struct LossBreakdown {
    pub total: Tensor,
    pub base: Tensor,
    pub input_reg: Tensor,
    pub model_reg: Tensor,
    pub unary_reg: Tensor,
    pub binary_reg: Tensor,
    /// Slot counts the decay factors were computed from
    pub stats: SparsityStats,
    /// Sigmoid output of the forward pass
    pub probabilities: Tensor,
}

impl LossBreakdown {
    /// Read the scalar values out as step metrics
    pub fn metrics(&self, labels: &Tensor) -> Result<StepMetrics> {
        let (correct, samples) = count_correct(&self.probabilities, labels)?;
        let group = |reg: &Tensor, stats: &GroupStats| -> Result<GroupMetrics> {
            Ok(GroupMetrics {
                reg_loss: scalar_f64(reg)?,
                threshold_mean: stats.threshold_mean(),
                weight_mean: stats.weight_mean(),
                sparsity: stats.sparsity(),
            })
        };
        Ok(StepMetrics {
            total_loss: scalar_f64(&self.total)?,
            regression_loss: scalar_f64(&self.base)?,
            input: group(&self.input_reg, &self.stats.input)?,
            model: group(&self.model_reg, &self.stats.model)?,
            unary: group(&self.unary_reg, &self.stats.unary)?,
            binary: group(&self.binary_reg, &self.stats.binary)?,
            correct,
            samples,
            grad_norm: 0.0,
            skipped: false,
        })
    }
}

/// Differentiable mean over all elements of several threshold tensors, in f64
///
/// `None` for a group without slots.
fn threshold_mean(thresholds: &[&Tensor]) -> Result<Option<Tensor>> {
    let flat = thresholds
        .iter()
        .map(|t| t.flatten_all().and_then(|t| t.to_dtype(DType::F64)))
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(|e| SymbolicError::Tensor(format!("threshold flatten failed: {}", e)))?;
    if flat.iter().all(|t| t.elem_count() == 0) {
        return Ok(None);
    }
    Tensor::cat(&flat, 0)
        .and_then(|t| t.mean_all())
        .map(Some)
        .map_err(|e| SymbolicError::Tensor(format!("threshold mean failed: {}", e)))
}

/// `base · exp(-mean) · decay`, zero for an empty group
fn regularization_term(base: &Tensor, thresholds: &[&Tensor], decay: f64) -> Result<Tensor> {
    let Some(mean) = threshold_mean(thresholds)? else {
        return base
            .zeros_like()
            .map_err(|e| SymbolicError::Tensor(format!("regularization term failed: {}", e)));
    };
    mean.neg()
        .and_then(|t| t.exp())
        .and_then(|t| base.mul(&t))
        .and_then(|t| t.affine(decay, 0.0))
        .map_err(|e| SymbolicError::Tensor(format!("regularization term failed: {}", e)))
}

// =============================================================================
// Trainer
// =============================================================================

/// One epoch of [`Trainer::fit`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub metrics: StepMetrics,
}

/// Per-epoch history returned by [`Trainer::fit`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitHistory {
    pub epochs: Vec<EpochRecord>,
    pub stopped_early: bool,
}

impl FitHistory {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Mean regression loss per epoch
    pub fn regression_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.metrics.regression_loss).collect()
    }
}

/// Owns a model and its optimizer and runs the regularized training step
pub struct Trainer {
    model: SymbolicModel,
    optimizer: Optimizer,
    targets: SparsityTargets,
    /// Trainable variables under their checkpoint names
    vars: Vec<(String, Var)>,
    steps: usize,
}

impl Trainer {
    /// Build the optimizer named in `config` over every trainable variable
    pub fn new(
        model: SymbolicModel,
        targets: SparsityTargets,
        config: &TrainingConfig,
    ) -> Result<Self> {
        let vars = named_vars(&model);
        let optimizer = Optimizer::new(
            config.optimizer,
            vars.iter().map(|(_, var)| var.clone()).collect(),
            config.learning_rate,
            config.weight_decay,
        )?;
        Ok(Self {
            model,
            optimizer,
            targets,
            vars,
            steps: 0,
        })
    }

    pub fn model(&self) -> &SymbolicModel {
        &self.model
    }

    pub fn into_model(self) -> SymbolicModel {
        self.model
    }

    pub fn targets(&self) -> &SparsityTargets {
        &self.targets
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr)
    }

    /// Forward pass and every loss component, without updating anything
    pub fn loss_breakdown(&self, features: &Tensor, labels: &Tensor) -> Result<LossBreakdown> {
        let probabilities = sigmoid(&self.model.forward_logits(features)?)?;
        let base = binary_cross_entropy_f64(&probabilities, labels)?;

        let stats = SparsityStats::from_model(&self.model)?;

        let input = self.model.input_sparsity();
        let mut model_thresholds = Vec::new();
        let mut unary_thresholds = Vec::new();
        let mut binary_thresholds = Vec::new();
        for layer in self.model.layers() {
            let params = layer.params();
            model_thresholds.push(params.weight_threshold.as_tensor());
            model_thresholds.push(params.bias_threshold.as_tensor());
            if let Some(threshold) = &params.unary_threshold {
                unary_thresholds.push(threshold.as_tensor());
            }
            if let Some(threshold) = &params.binary_threshold {
                binary_thresholds.push(threshold.as_tensor());
            }
        }

        let input_reg = regularization_term(
            &base,
            &[input.threshold.as_tensor()],
            decay_factor(stats.input.sparsity(), self.targets.input),
        )?;
        let model_reg = regularization_term(
            &base,
            &model_thresholds,
            decay_factor(stats.model.sparsity(), self.targets.model),
        )?;
        let unary_reg = regularization_term(
            &base,
            &unary_thresholds,
            decay_factor(stats.unary.sparsity(), self.targets.unary),
        )?;
        let binary_reg = regularization_term(
            &base,
            &binary_thresholds,
            decay_factor(stats.binary.sparsity(), self.targets.binary),
        )?;

        let total = (&base + &input_reg)
            .and_then(|t| t + &model_reg)
            .and_then(|t| t + &unary_reg)
            .and_then(|t| t + &binary_reg)
            .map_err(|e| SymbolicError::Tensor(format!("total loss failed: {}", e)))?;

        Ok(LossBreakdown {
            total,
            base,
            input_reg,
            model_reg,
            unary_reg,
            binary_reg,
            stats,
            probabilities,
        })
    }

    /// Loss and metrics on a batch without a parameter update
    pub fn evaluate(&self, features: &Tensor, labels: &Tensor) -> Result<StepMetrics> {
        self.loss_breakdown(features, labels)?.metrics(labels)
    }

    /// One optimization step on a batch
    ///
    /// Metrics describe the parameters before the update. When a gradient is
    /// not finite the update is skipped and the step is flagged.
    pub fn train_step(&mut self, features: &Tensor, labels: &Tensor) -> Result<StepMetrics> {
        let breakdown = self.loss_breakdown(features, labels)?;
        let grads = breakdown
            .total
            .backward()
            .map_err(|e| SymbolicError::Training(format!("backward failed: {}", e)))?;

        let mut metrics = breakdown.metrics(labels)?;
        let report = GradientReport::inspect(&grads, &self.vars)?;
        metrics.grad_norm = report.norm;

        if report.is_finite() {
            self.optimizer.step(&grads)?;
            self.model.apply_constraints()?;
        } else {
            warn!(
                "Non-finite gradients at step {} in {}, skipping update",
                self.steps,
                report.non_finite.join(", ")
            );
            metrics.skipped = true;
        }
        self.steps += 1;

        debug!(
            "step {}: loss={:.4} bce={:.4} acc={:.3}",
            self.steps,
            metrics.total_loss,
            metrics.regression_loss,
            metrics.accuracy()
        );
        Ok(metrics)
    }

    /// Train for `config.epochs` epochs over `train`
    ///
    /// Running means are reset at every epoch boundary. The learning rate is
    /// reduced on a plateau of the mean regression loss and training stops
    /// early when it stops improving.
    pub fn fit(&mut self, train: &Dataset, config: &TrainingConfig) -> Result<FitHistory> {
        if config.batch_size == 0 {
            return Err(SymbolicError::Config("batch size must be non-zero".into()));
        }
        if train.is_empty() {
            return Err(SymbolicError::Data("training set is empty".into()));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut plateau = ReduceLrOnPlateau::new(config.plateau.clone());
        let mut stopping = EarlyStopping::new(config.early_stopping.clone());
        let mut running = TrainingMetrics::new();
        let mut history = FitHistory::default();

        info!(
            "Training on {} samples for {} epochs (batch size {})",
            train.len(),
            config.epochs,
            config.batch_size
        );

        for epoch in 0..config.epochs {
            let shuffle_rng = if config.shuffle { Some(&mut rng) } else { None };
            for batch in train.batches(config.batch_size, shuffle_rng)? {
                let step = self.train_step(&batch.features, &batch.labels)?;
                running.update(&step);
            }

            let Some(summary) = running.result() else {
                break;
            };
            let learning_rate = self.learning_rate();
            info!(
                "Epoch {}/{}: loss={:.4} regression_loss={:.4} accuracy={:.4} sparsity=[{:.3}, {:.3}, {:.3}, {:.3}] lr={:.1e}",
                epoch + 1,
                config.epochs,
                summary.total_loss,
                summary.regression_loss,
                summary.accuracy(),
                summary.input.sparsity,
                summary.model.sparsity,
                summary.unary.sparsity,
                summary.binary.sparsity,
                learning_rate
            );
            if running.skipped() > 0 {
                warn!("Epoch {}: {} updates skipped", epoch + 1, running.skipped());
            }
            history.epochs.push(EpochRecord {
                epoch,
                learning_rate,
                metrics: summary,
            });
            running.reset();

            if let Some(new_lr) = plateau.observe(summary.regression_loss, learning_rate) {
                info!("Reducing learning rate to {:.1e}", new_lr);
                self.set_learning_rate(new_lr);
            }
            if stopping.observe(summary.regression_loss) {
                info!("Early stopping after epoch {}", epoch + 1);
                history.stopped_early = true;
                break;
            }
        }

        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BinaryOp, HiddenLayerSpec, ModelConfig, OperatorMenu, UnaryOp};
    use candle_core::Device;

    fn model() -> SymbolicModel {
        let config = ModelConfig::new(4, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Sin, UnaryOp::Exp], vec![BinaryOp::Add]),
            2,
            1,
        ));
        SymbolicModel::new(config, &Device::Cpu).unwrap()
    }

    fn batch() -> (Tensor, Tensor) {
        let x = Tensor::new(
            &[[1u8, 0, 1, 0], [0, 1, 1, 1], [1, 1, 0, 0], [0, 0, 0, 1]],
            &Device::Cpu,
        )
        .unwrap();
        let y = Tensor::new(&[[1u8], [0], [1], [0]], &Device::Cpu).unwrap();
        (x, y)
    }

    fn sgd_config(lr: f64) -> TrainingConfig {
        TrainingConfig {
            optimizer: OptimizerKind::Sgd,
            learning_rate: lr,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.epochs, 25);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert!((config.learning_rate - 5e-3).abs() < 1e-12);

        let partial: TrainingConfig = serde_json::from_str(r#"{"epochs": 3}"#).unwrap();
        assert_eq!(partial.epochs, 3);
        assert_eq!(partial.batch_size, 32);
    }

    #[test]
    fn test_total_at_least_base() {
        let trainer = Trainer::new(model(), SparsityTargets::default(), &sgd_config(0.1)).unwrap();
        let (x, y) = batch();
        let breakdown = trainer.loss_breakdown(&x, &y).unwrap();
        assert_eq!(breakdown.total.dtype(), DType::F64);

        let metrics = breakdown.metrics(&y).unwrap();
        assert!(metrics.total_loss >= metrics.regression_loss);
        // fresh model: thresholds at 0, nothing pruned, decay 1
        let expected = metrics.regression_loss * 5.0;
        assert!((metrics.total_loss - expected).abs() < 1e-9);
        assert_eq!(metrics.samples, 4);
    }

    #[test]
    fn test_model_without_binary_units() {
        let config = ModelConfig::new(4, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::identity(),
            2,
            0,
        ));
        let model = SymbolicModel::new(config, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(model, SparsityTargets::default(), &sgd_config(0.1)).unwrap();
        let (x, y) = batch();

        let metrics = trainer.evaluate(&x, &y).unwrap();
        // input, model and unary terms equal the base at init, the empty binary group adds nothing
        assert_eq!(metrics.binary.reg_loss, 0.0);
        assert_eq!(metrics.binary.sparsity, 0.0);
        let expected = metrics.regression_loss * 4.0;
        assert!((metrics.total_loss - expected).abs() < 1e-9);

        let step = trainer.train_step(&x, &y).unwrap();
        assert!(!step.skipped);
        assert!(step.total_loss.is_finite());
    }

    #[test]
    fn test_reached_target_drops_term() {
        let trainer = Trainer::new(
            model(),
            SparsityTargets {
                input: 0.0,
                model: 0.0,
                unary: 0.0,
                binary: 0.0,
            },
            &sgd_config(0.1),
        )
        .unwrap();
        let (x, y) = batch();
        let metrics = trainer.evaluate(&x, &y).unwrap();
        assert!((metrics.total_loss - metrics.regression_loss).abs() < 1e-12);
        assert_eq!(metrics.input.reg_loss, 0.0);
    }

    #[test]
    fn test_sgd_step_moves_by_gradient() {
        let lr = 0.05;
        let mut trainer = Trainer::new(model(), SparsityTargets::default(), &sgd_config(lr)).unwrap();
        let (x, y) = batch();

        let weight = trainer.model().layer(0).unwrap().weight.clone();
        let before = weight.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let grads = trainer.loss_breakdown(&x, &y).unwrap().total.backward().unwrap();
        let grad = grads
            .get(weight.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let metrics = trainer.train_step(&x, &y).unwrap();
        assert!(!metrics.skipped);
        assert!(metrics.grad_norm > 0.0);
        assert_eq!(trainer.steps(), 1);

        let after = weight.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for i in 0..before.len() {
            let expected = before[i] - lr as f32 * grad[i];
            assert!((after[i] - expected).abs() < 1e-5, "{} vs {}", after[i], expected);
        }
    }

    #[test]
    fn test_thresholds_receive_gradient() {
        let trainer = Trainer::new(model(), SparsityTargets::default(), &sgd_config(0.1)).unwrap();
        let (x, y) = batch();
        let grads = trainer.loss_breakdown(&x, &y).unwrap().total.backward().unwrap();

        let input = trainer.model().input_sparsity();
        let grad = grads.get(input.threshold.as_tensor()).unwrap();
        // the regularizer pushes every threshold up
        for g in grad.to_vec1::<f32>().unwrap() {
            assert!(g < 0.0);
        }
    }

    #[test]
    fn test_constraints_after_step() {
        let mut trainer = Trainer::new(model(), SparsityTargets::default(), &sgd_config(100.0)).unwrap();
        let (x, y) = batch();
        trainer.train_step(&x, &y).unwrap();

        let input = trainer.model().input_sparsity();
        for t in input.threshold.as_tensor().to_vec1::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&t));
        }
        let hidden = trainer.model().layer(0).unwrap();
        for t in hidden
            .weight_threshold
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
        {
            assert!(t >= 0.0);
        }
    }

    #[test]
    fn test_fit_records_epochs() {
        let (x, y) = batch();
        let dataset = Dataset::new(x, y).unwrap();
        let config = TrainingConfig {
            epochs: 3,
            batch_size: 2,
            ..Default::default()
        };
        let mut trainer = Trainer::new(model(), SparsityTargets::default(), &config).unwrap();
        let history = trainer.fit(&dataset, &config).unwrap();

        assert_eq!(history.epochs.len(), 3);
        assert!(!history.stopped_early);
        assert_eq!(trainer.steps(), 6);
        for record in &history.epochs {
            assert_eq!(record.metrics.samples, 4);
            assert!(record.metrics.regression_loss.is_finite());
        }
        assert_eq!(history.regression_losses().len(), 3);
    }
}
