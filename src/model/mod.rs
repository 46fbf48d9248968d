//! Symbolic Regression Model
//!
//! Assembly of the input-sparsity layer, hidden symbolic layers and the
//! identity-only output layer into one classifier.
//!
//! ## Architecture
//!
//! ```text
//! x (batch, input_dim)
//!   → InputSparsity
//!   → SymbolicLayer (hidden 1) … SymbolicLayer (hidden N)
//!   → SymbolicLayer (identity only, output_dim units)
//!   → sigmoid
//! ```
//!
//! ## Validation
//!
//! A configuration is checked before any tensor is allocated. Every problem
//! found is reported, not only the first:
//!
//! - input and output dimensions must be non-zero
//! - at least one hidden layer
//! - every hidden layer needs `num_unary > 0` and a non-empty unary menu
//! - a layer with binary units needs a non-empty binary menu
//!
//! A model without binary units is valid. Its binary sparsity group is empty
//! and contributes nothing to the regularized loss.

mod algebra;
pub mod checkpoint;
mod layers;
mod operators;

pub use algebra::{apply_layer, evaluate, EvalAlgebra, TensorAlgebra};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};
pub use layers::{InputSparsity, LayerParams, LayerRole, ParamSlot, SymbolicLayer, INIT_STDDEV};
pub use operators::{BinaryOp, OperatorMenu, UnaryOp, OPERATOR_EPSILON};

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::primitives::{count_correct, sigmoid};
use crate::{Result, SymbolicError};

// =============================================================================
// Configuration
// =============================================================================

/// Operator menu and unit counts of one hidden layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenLayerSpec {
    pub menu: OperatorMenu,
    pub num_unary: usize,
    #[serde(default)]
    pub num_binary: usize,
}

impl HiddenLayerSpec {
    pub fn new(menu: OperatorMenu, num_unary: usize, num_binary: usize) -> Self {
        Self {
            menu,
            num_unary,
            num_binary,
        }
    }

    /// Layer output width
    pub fn output_units(&self) -> usize {
        self.num_unary + self.num_binary
    }
}

/// Dimensions and hidden layers of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub hidden: Vec<HiddenLayerSpec>,
}

impl Default for ModelConfig {
    /// 512 input bits, one hidden layer of 10 `sin`/`exp` units and
    /// 5 `add` units, one output
    fn default() -> Self {
        Self::new(512, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Sin, UnaryOp::Exp], vec![BinaryOp::Add]),
            10,
            5,
        ))
    }
}

impl ModelConfig {
    /// Config without hidden layers; add them with [`ModelConfig::with_hidden`]
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            hidden: Vec::new(),
        }
    }

    /// Builder: append a hidden layer
    pub fn with_hidden(mut self, layer: HiddenLayerSpec) -> Self {
        self.hidden.push(layer);
        self
    }

    /// Report every problem with this configuration
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.input_dim == 0 {
            errors.push(ValidationError::new("input dimension must be non-zero", None));
        }
        if self.output_dim == 0 {
            errors.push(ValidationError::new("output dimension must be non-zero", None));
        }
        if self.hidden.is_empty() {
            errors.push(
                ValidationError::new("model has no hidden layers", None)
                    .with_suggestion("add one with ModelConfig::with_hidden"),
            );
        }

        for (idx, layer) in self.hidden.iter().enumerate() {
            if layer.num_unary == 0 {
                errors.push(
                    ValidationError::new("hidden layer has no unary units", Some(idx))
                        .with_suggestion("every hidden layer needs num_unary > 0"),
                );
            }
            if layer.menu.unary.is_empty() {
                errors.push(
                    ValidationError::new("unary operator menu is empty", Some(idx))
                        .with_suggestion("use [identity] for a plain linear layer"),
                );
            }
            if layer.num_binary > 0 && layer.menu.binary.is_empty() {
                errors.push(ValidationError::new(
                    format!(
                        "{} binary units but the binary operator menu is empty",
                        layer.num_binary
                    ),
                    Some(idx),
                ));
            }
        }

        errors
    }

    /// Validate and return Result
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            let msg = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            Err(SymbolicError::Config(format!(
                "Validation errors:\n{}",
                msg
            )))
        }
    }
}

/// Configuration problem with the hidden layer it was found in
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
    pub layer_index: Option<usize>,
    pub suggestion: Option<String>,
}

impl ValidationError {
    fn new(message: impl Into<String>, layer_index: Option<usize>) -> Self {
        Self {
            message: message.into(),
            layer_index,
            suggestion: None,
        }
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(idx) = self.layer_index {
            write!(f, " [hidden layer {}]", idx)?;
        }
        if let Some(ref sug) = self.suggestion {
            write!(f, "\n  = help: {}", sug)?;
        }
        Ok(())
    }
}

/// What the expression extractor needs to know about a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Operator menu per hidden layer
    pub menus: Vec<OperatorMenu>,
    pub num_unary: Vec<usize>,
    pub num_binary: Vec<usize>,
}

impl Hyperparameters {
    pub fn num_hidden(&self) -> usize {
        self.menus.len()
    }
}

// =============================================================================
// Model
// =============================================================================

/// Input sparsity, hidden symbolic layers and an identity-only output layer
#[derive(Debug)]
pub struct SymbolicModel {
    config: ModelConfig,
    input: InputSparsity,
    layers: Vec<SymbolicLayer>,
    device: Device,
}

impl SymbolicModel {
    /// Validate `config` and allocate all parameters on `device`
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate_strict()?;

        let input = InputSparsity::new(config.input_dim, device)?;
        let mut layers = Vec::with_capacity(config.hidden.len() + 1);
        let mut width = config.input_dim;
        for spec in &config.hidden {
            layers.push(SymbolicLayer::hidden(width, spec, device)?);
            width = spec.output_units();
        }
        layers.push(SymbolicLayer::output(width, config.output_dim, device)?);

        let model = Self {
            config,
            input,
            layers,
            device: device.clone(),
        };
        info!(
            "Assembled symbolic model: {} inputs, {} hidden layers, {} outputs, {} parameters",
            model.config.input_dim,
            model.config.hidden.len(),
            model.config.output_dim,
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            input_dim: self.config.input_dim,
            output_dim: self.config.output_dim,
            menus: self.config.hidden.iter().map(|h| h.menu.clone()).collect(),
            num_unary: self.config.hidden.iter().map(|h| h.num_unary).collect(),
            num_binary: self.config.hidden.iter().map(|h| h.num_binary).collect(),
        }
    }

    pub fn input_sparsity(&self) -> &InputSparsity {
        &self.input
    }

    /// Hidden layers followed by the output layer
    pub fn layers(&self) -> &[SymbolicLayer] {
        &self.layers
    }

    /// Named parameters of layer `index` (the output layer is last)
    pub fn layer(&self, index: usize) -> Option<&LayerParams> {
        self.layers.get(index).map(|layer| layer.params())
    }

    /// Every trainable variable: input threshold first, then per layer in slot order
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.input.trainable_vars();
        for layer in &self.layers {
            vars.extend(layer.trainable_vars());
        }
        vars
    }

    /// Total trainable scalar count
    pub fn num_parameters(&self) -> usize {
        self.trainable_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Re-impose threshold constraints after an optimizer update
    pub fn apply_constraints(&self) -> Result<()> {
        self.input.apply_constraints()?;
        for layer in &self.layers {
            layer.apply_constraints()?;
        }
        Ok(())
    }

    /// Pre-sigmoid output, `(batch, output_dim)`
    pub fn forward_logits(&self, x: &Tensor) -> Result<Tensor> {
        let x = x
            .to_dtype(candle_core::DType::F32)
            .map_err(|e| SymbolicError::Tensor(format!("input cast failed: {}", e)))?;
        evaluate(&TensorAlgebra::default(), &self.input, &self.layers, &x)
    }

    /// Class probabilities, `(batch, output_dim)`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        sigmoid(&self.forward_logits(x)?)
    }

    /// Probabilities without gradient tracking
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward(x)?.detach())
    }

    /// Fraction of samples classified correctly
    pub fn accuracy(&self, features: &Tensor, labels: &Tensor) -> Result<f64> {
        let probabilities = self.predict(features)?;
        let (correct, total) = count_correct(&probabilities, labels)?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(correct as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{sigmoid, step_mask};
    use candle_core::DType;

    fn small_config() -> ModelConfig {
        ModelConfig::new(4, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Sin, UnaryOp::Square], vec![BinaryOp::Multiply]),
            3,
            2,
        ))
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.input_dim, 512);
        assert_eq!(config.hidden[0].output_units(), 15);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let config = ModelConfig::new(0, 1)
            .with_hidden(HiddenLayerSpec::new(OperatorMenu::new(vec![], vec![]), 0, 2));
        let errors = config.validate();
        // input dim, no unary units, empty unary menu, empty binary menu
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.layer_index == Some(0)));

        let err = SymbolicModel::new(config, &Device::Cpu).unwrap_err();
        assert!(matches!(err, SymbolicError::Config(_)));
        assert!(err.to_string().contains("hidden layer 0"));
    }

    #[test]
    fn test_validation_requires_hidden_layer() {
        let no_hidden = ModelConfig::new(3, 1).validate();
        assert!(no_hidden.iter().any(|e| e.message.contains("no hidden layers")));

        let no_binary = ModelConfig::new(3, 1)
            .with_hidden(HiddenLayerSpec::new(OperatorMenu::identity(), 2, 0))
            .validate();
        assert!(no_binary.is_empty());
    }

    #[test]
    fn test_assembly_shapes() {
        let model = SymbolicModel::new(small_config(), &Device::Cpu).unwrap();
        assert_eq!(model.layers().len(), 2);
        assert_eq!(model.layer(0).unwrap().weight.as_tensor().dims(), &[4, 7]);
        assert_eq!(model.layer(1).unwrap().weight.as_tensor().dims(), &[5, 1]);
        assert!(model.layer(2).is_none());

        let x = Tensor::ones((6, 4), DType::F32, &Device::Cpu).unwrap();
        let p = model.forward(&x).unwrap();
        assert_eq!(p.dims(), &[6, 1]);
        for v in p.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_hyperparameters() {
        let model = SymbolicModel::new(small_config(), &Device::Cpu).unwrap();
        let hp = model.hyperparameters();
        assert_eq!(hp.num_hidden(), 1);
        assert_eq!(hp.num_unary, vec![3]);
        assert_eq!(hp.num_binary, vec![2]);
        assert_eq!(hp.menus[0].binary, vec![BinaryOp::Multiply]);
    }

    #[test]
    fn test_trainable_vars_count() {
        let model = SymbolicModel::new(small_config(), &Device::Cpu).unwrap();
        // input threshold + 6 hidden + 4 output
        assert_eq!(model.trainable_vars().len(), 11);
        let expected = 4 + (4 * 7 * 2 + 7 * 2 + 3 + 2) + (5 * 2 + 2);
        assert_eq!(model.num_parameters(), expected);
    }

    #[test]
    fn test_identity_model_matches_dense_reference() {
        let config = ModelConfig::new(3, 1).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Identity], vec![]),
            2,
            0,
        ));
        let model = SymbolicModel::new(config, &Device::Cpu).unwrap();
        let hidden = model.layer(0).unwrap();
        assert_eq!(hidden.weight.as_tensor().dims(), &[3, 2]);
        assert!(hidden.binary_threshold.is_none());

        // sigmoid((x·W1 + b1)·W2 + b2) with every mask open at init
        let x = Tensor::new(&[[1.0f32, 0.0, 1.0], [0.0, 1.0, 1.0], [1.0, 1.0, 0.0]], &Device::Cpu)
            .unwrap();
        let out = model.layer(1).unwrap();
        let logits = x
            .matmul(hidden.weight.as_tensor())
            .unwrap()
            .broadcast_add(hidden.bias.as_tensor())
            .unwrap()
            .matmul(out.weight.as_tensor())
            .unwrap()
            .broadcast_add(out.bias.as_tensor())
            .unwrap();
        let expected = sigmoid(&logits).unwrap().to_vec2::<f32>().unwrap();

        let got = model.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (row_g, row_e) in got.iter().zip(expected.iter()) {
            for (g, e) in row_g.iter().zip(row_e.iter()) {
                assert!((g - e).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_identity_add_model_matches_dense_reference() {
        let config = ModelConfig::new(3, 2).with_hidden(HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Identity], vec![BinaryOp::Add]),
            2,
            1,
        ));
        let model = SymbolicModel::new(config, &Device::Cpu).unwrap();
        let x = Tensor::new(&[[1.0f32, 0.0, 1.0], [0.0, 1.0, 1.0]], &Device::Cpu).unwrap();

        // masks at init keep every non-zero weight, the binary add pair sums either way
        let hidden = model.layer(0).unwrap();
        let w = hidden.weight.as_tensor();
        let h = x.matmul(w).unwrap().broadcast_add(hidden.bias.as_tensor()).unwrap();
        let h = Tensor::cat(
            &[
                h.narrow(1, 0, 2).unwrap(),
                (h.narrow(1, 2, 1).unwrap() + h.narrow(1, 3, 1).unwrap()).unwrap(),
            ],
            1,
        )
        .unwrap();
        let out = model.layer(1).unwrap();
        let logits = h
            .matmul(out.weight.as_tensor())
            .unwrap()
            .broadcast_add(out.bias.as_tensor())
            .unwrap();
        let expected = sigmoid(&logits).unwrap().to_vec2::<f32>().unwrap();

        let got = model.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (row_g, row_e) in got.iter().zip(expected.iter()) {
            for (g, e) in row_g.iter().zip(row_e.iter()) {
                assert!((g - e).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_accuracy_and_constraints() {
        let model = SymbolicModel::new(small_config(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1u8], [0], [1], [0]], &Device::Cpu).unwrap();
        let acc = model.accuracy(&x, &labels).unwrap();
        // identical rows give identical predictions: half the labels agree
        assert!((acc - 0.5).abs() < 1e-12);

        model.apply_constraints().unwrap();
        let mask = step_mask(
            &(model.input_sparsity().reference.clone() - model.input_sparsity().threshold.as_tensor())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(mask.to_vec1::<f32>().unwrap(), vec![1.0; 4]);
    }
}
