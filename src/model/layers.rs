//! Network Layers
//!
//! - [`InputSparsity`]: per-feature keep/drop gate in front of the network
//! - [`SymbolicLayer`]: masked dense transform followed by prunable operators
//!
//! Every learnable slot has a threshold of the same shape. A slot is kept
//! while `magnitude - threshold > 0`:
//!
//! | Slot          | Magnitude        | Threshold constraint |
//! |---------------|------------------|----------------------|
//! | input feature | fixed `1`        | clipped to `[0, 1]`  |
//! | weight / bias | `|w|`, `|b|`     | `abs` (non-negative) |
//! | operator      | fixed `1`        | clipped to `[0, 1]`  |

use candle_core::{DType, Device, Tensor, Var};

use super::algebra::{apply_layer, TensorAlgebra};
use super::operators::OperatorMenu;
use super::HiddenLayerSpec;
use crate::{Result, SymbolicError};

/// Standard deviation of the random-normal weight and bias initializer
pub const INIT_STDDEV: f32 = 0.05;

/// Fixed ordering of a layer's parameter slots
///
/// The terminal layer only has the first four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSlot {
    Weight,
    Bias,
    WeightThreshold,
    BiasThreshold,
    UnaryRef,
    UnaryThreshold,
    BinaryRef,
    BinaryThreshold,
}

impl ParamSlot {
    pub const ALL: [ParamSlot; 8] = [
        Self::Weight,
        Self::Bias,
        Self::WeightThreshold,
        Self::BiasThreshold,
        Self::UnaryRef,
        Self::UnaryThreshold,
        Self::BinaryRef,
        Self::BinaryThreshold,
    ];

    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|slot| slot == self)
            .unwrap_or_default()
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Name used in checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            Self::Weight => "weight",
            Self::Bias => "bias",
            Self::WeightThreshold => "weight_threshold",
            Self::BiasThreshold => "bias_threshold",
            Self::UnaryRef => "unary",
            Self::UnaryThreshold => "unary_threshold",
            Self::BinaryRef => "binary",
            Self::BinaryThreshold => "binary_threshold",
        }
    }

    /// Whether the optimizer updates this slot
    pub fn is_trainable(&self) -> bool {
        !matches!(self, Self::UnaryRef | Self::BinaryRef)
    }
}

fn zeros_var(shape: impl Into<candle_core::Shape>, device: &Device, what: &str) -> Result<Var> {
    Var::zeros(shape, DType::F32, device)
        .map_err(|e| SymbolicError::Tensor(format!("Failed to create {}: {}", what, e)))
}

fn normal_var(shape: impl Into<candle_core::Shape>, device: &Device, what: &str) -> Result<Var> {
    let init = Tensor::randn(0.0f32, INIT_STDDEV, shape, device)
        .map_err(|e| SymbolicError::Tensor(format!("Failed to create {}: {}", what, e)))?;
    Var::from_tensor(&init)
        .map_err(|e| SymbolicError::Tensor(format!("Failed to create {} var: {}", what, e)))
}

fn ones(len: usize, device: &Device, what: &str) -> Result<Tensor> {
    Tensor::ones(len, DType::F32, device)
        .map_err(|e| SymbolicError::Tensor(format!("Failed to create {}: {}", what, e)))
}

fn clamp_unit(var: &Var) -> Result<()> {
    let clamped = var.as_tensor().clamp(0.0f32, 1.0f32)?;
    var.set(&clamped)
        .map_err(|e| SymbolicError::Tensor(format!("threshold clamp failed: {}", e)))
}

fn make_non_negative(var: &Var) -> Result<()> {
    let magnitude = var.as_tensor().abs()?;
    var.set(&magnitude)
        .map_err(|e| SymbolicError::Tensor(format!("threshold abs failed: {}", e)))
}

// =============================================================================
// Input sparsity
// =============================================================================

/// Learns which input features the network may look at
#[derive(Debug)]
pub struct InputSparsity {
    /// Fixed all-ones magnitude, one per feature
    pub reference: Tensor,
    /// Trainable threshold in `[0, 1]`, initialized at 0
    pub threshold: Var,
}

impl InputSparsity {
    pub fn new(input_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            reference: ones(input_dim, device, "input reference")?,
            threshold: zeros_var(input_dim, device, "input threshold")?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.reference.elem_count()
    }

    /// `x ⊙ step(1 - threshold)`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        use super::algebra::EvalAlgebra;
        TensorAlgebra::default().mask_inputs(x, self)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.threshold.clone()]
    }

    pub fn apply_constraints(&self) -> Result<()> {
        clamp_unit(&self.threshold)
    }
}

// =============================================================================
// Symbolic layer
// =============================================================================

/// Named parameters of one symbolic layer
///
/// Operator slots are `None` on the terminal layer, binary slots are `None`
/// on a hidden layer without binary units.
#[derive(Debug)]
pub struct LayerParams {
    /// `(inputs, affine_units)`
    pub weight: Var,
    /// `(affine_units,)`
    pub bias: Var,
    pub weight_threshold: Var,
    pub bias_threshold: Var,
    /// Fixed all-ones magnitude per unary operator
    pub unary_ref: Option<Tensor>,
    pub unary_threshold: Option<Var>,
    /// Fixed all-ones magnitude per binary operator
    pub binary_ref: Option<Tensor>,
    pub binary_threshold: Option<Var>,
}

impl LayerParams {
    /// Access a slot by its fixed position
    pub fn slot(&self, slot: ParamSlot) -> Option<&Tensor> {
        match slot {
            ParamSlot::Weight => Some(self.weight.as_tensor()),
            ParamSlot::Bias => Some(self.bias.as_tensor()),
            ParamSlot::WeightThreshold => Some(self.weight_threshold.as_tensor()),
            ParamSlot::BiasThreshold => Some(self.bias_threshold.as_tensor()),
            ParamSlot::UnaryRef => self.unary_ref.as_ref(),
            ParamSlot::UnaryThreshold => self.unary_threshold.as_ref().map(|v| v.as_tensor()),
            ParamSlot::BinaryRef => self.binary_ref.as_ref(),
            ParamSlot::BinaryThreshold => self.binary_threshold.as_ref().map(|v| v.as_tensor()),
        }
    }

    /// The variable behind a trainable slot
    pub fn var(&self, slot: ParamSlot) -> Option<&Var> {
        match slot {
            ParamSlot::Weight => Some(&self.weight),
            ParamSlot::Bias => Some(&self.bias),
            ParamSlot::WeightThreshold => Some(&self.weight_threshold),
            ParamSlot::BiasThreshold => Some(&self.bias_threshold),
            ParamSlot::UnaryThreshold => self.unary_threshold.as_ref(),
            ParamSlot::BinaryThreshold => self.binary_threshold.as_ref(),
            ParamSlot::UnaryRef | ParamSlot::BinaryRef => None,
        }
    }

    /// Slots present on this layer, in fixed order
    pub fn slots(&self) -> Vec<ParamSlot> {
        ParamSlot::ALL
            .iter()
            .copied()
            .filter(|slot| self.slot(*slot).is_some())
            .collect()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        ParamSlot::ALL
            .iter()
            .filter_map(|slot| self.var(*slot))
            .cloned()
            .collect()
    }
}

/// Whether a layer searches operators or only combines linearly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    Hidden,
    Output,
}

/// Dense transform followed by per-unit prunable operators
#[derive(Debug)]
pub struct SymbolicLayer {
    params: LayerParams,
    menu: OperatorMenu,
    num_unary: usize,
    num_binary: usize,
    role: LayerRole,
}

impl SymbolicLayer {
    /// Hidden layer searching over `spec.menu`
    pub fn hidden(input_dim: usize, spec: &HiddenLayerSpec, device: &Device) -> Result<Self> {
        let units = spec.num_unary + 2 * spec.num_binary;
        let (binary_ref, binary_threshold) = if spec.num_binary > 0 {
            (
                Some(ones(spec.num_binary, device, "binary reference")?),
                Some(zeros_var(spec.num_binary, device, "binary threshold")?),
            )
        } else {
            (None, None)
        };

        let params = LayerParams {
            weight: normal_var((input_dim, units), device, "weight")?,
            bias: normal_var(units, device, "bias")?,
            weight_threshold: zeros_var((input_dim, units), device, "weight threshold")?,
            bias_threshold: zeros_var(units, device, "bias threshold")?,
            unary_ref: Some(ones(spec.num_unary, device, "unary reference")?),
            unary_threshold: Some(zeros_var(spec.num_unary, device, "unary threshold")?),
            binary_ref,
            binary_threshold,
        };

        Ok(Self {
            params,
            menu: spec.menu.clone(),
            num_unary: spec.num_unary,
            num_binary: spec.num_binary,
            role: LayerRole::Hidden,
        })
    }

    /// Terminal identity-only layer producing `output_dim` units
    pub fn output(input_dim: usize, output_dim: usize, device: &Device) -> Result<Self> {
        let params = LayerParams {
            weight: normal_var((input_dim, output_dim), device, "output weight")?,
            bias: normal_var(output_dim, device, "output bias")?,
            weight_threshold: zeros_var((input_dim, output_dim), device, "output weight threshold")?,
            bias_threshold: zeros_var(output_dim, device, "output bias threshold")?,
            unary_ref: None,
            unary_threshold: None,
            binary_ref: None,
            binary_threshold: None,
        };

        Ok(Self {
            params,
            menu: OperatorMenu::identity(),
            num_unary: output_dim,
            num_binary: 0,
            role: LayerRole::Output,
        })
    }

    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    pub fn menu(&self) -> &OperatorMenu {
        &self.menu
    }

    pub fn role(&self) -> LayerRole {
        self.role
    }

    pub fn num_unary(&self) -> usize {
        self.num_unary
    }

    pub fn num_binary(&self) -> usize {
        self.num_binary
    }

    pub fn input_dim(&self) -> usize {
        self.params.weight.as_tensor().dims()[0]
    }

    /// Width of the affine transform: `num_unary + 2 * num_binary`
    pub fn affine_units(&self) -> usize {
        self.num_unary + 2 * self.num_binary
    }

    /// Width of the layer output: `num_unary + num_binary`
    pub fn output_units(&self) -> usize {
        self.num_unary + self.num_binary
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        apply_layer(&TensorAlgebra::default(), self, x)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.params.trainable_vars()
    }

    /// Re-impose threshold constraints after an optimizer update
    pub fn apply_constraints(&self) -> Result<()> {
        make_non_negative(&self.params.weight_threshold)?;
        make_non_negative(&self.params.bias_threshold)?;
        if let Some(threshold) = &self.params.unary_threshold {
            clamp_unit(threshold)?;
        }
        if let Some(threshold) = &self.params.binary_threshold {
            clamp_unit(threshold)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::operators::{BinaryOp, UnaryOp};

    fn device() -> Device {
        Device::Cpu
    }

    fn hidden_spec(num_unary: usize, num_binary: usize) -> HiddenLayerSpec {
        HiddenLayerSpec::new(
            OperatorMenu::new(vec![UnaryOp::Sin, UnaryOp::Exp], vec![BinaryOp::Multiply]),
            num_unary,
            num_binary,
        )
    }

    fn set(var: &Var, values: Vec<f32>) {
        let shape = var.as_tensor().shape().clone();
        var.set(&Tensor::from_vec(values, shape, &device()).unwrap()).unwrap();
    }

    fn column(t: &Tensor, i: usize) -> Vec<f32> {
        t.narrow(1, i, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_param_slot_order() {
        for (i, slot) in ParamSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
            assert_eq!(ParamSlot::from_index(i), Some(*slot));
        }
        assert_eq!(ParamSlot::from_index(8), None);
        assert!(!ParamSlot::UnaryRef.is_trainable());
        assert!(ParamSlot::BinaryThreshold.is_trainable());
    }

    #[test]
    fn test_input_sparsity_shape() {
        let layer = InputSparsity::new(6, &device()).unwrap();
        for batch in [1usize, 3, 17] {
            let x = Tensor::ones((batch, 6), DType::F32, &device()).unwrap();
            let y = layer.forward(&x).unwrap();
            assert_eq!(y.dims(), &[batch, 6]);
        }
    }

    #[test]
    fn test_input_sparsity_zeroes_pruned_feature() {
        let layer = InputSparsity::new(3, &device()).unwrap();
        set(&layer.threshold, vec![0.0, 1.5, 0.2]);

        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), &device()).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(column(&y, 1), vec![0.0, 0.0]);
        assert_eq!(column(&y, 0), vec![1.0, 4.0]);
        assert_eq!(column(&y, 2), vec![3.0, 6.0]);
    }

    #[test]
    fn test_input_threshold_clipped() {
        let layer = InputSparsity::new(3, &device()).unwrap();
        set(&layer.threshold, vec![-0.5, 0.5, 2.0]);
        layer.apply_constraints().unwrap();
        assert_eq!(
            layer.threshold.as_tensor().to_vec1::<f32>().unwrap(),
            vec![0.0, 0.5, 1.0]
        );
    }

    #[test]
    fn test_symbolic_layer_output_units() {
        for (u, b) in [(3usize, 2usize), (1, 0), (4, 1)] {
            let layer = SymbolicLayer::hidden(5, &hidden_spec(u, b), &device()).unwrap();
            let x = Tensor::randn(0.0f32, 1.0, (4, 5), &device()).unwrap();
            let y = layer.forward(&x).unwrap();
            assert_eq!(y.dims(), &[4, u + b]);
            assert_eq!(layer.affine_units(), u + 2 * b);
            assert_eq!(layer.params().weight.as_tensor().dims(), &[5, u + 2 * b]);
        }
    }

    #[test]
    fn test_pruned_operators_fall_back() {
        let layer = SymbolicLayer::hidden(2, &hidden_spec(2, 1), &device()).unwrap();
        let params = layer.params();
        set(
            &params.weight,
            vec![0.5, -1.0, 0.3, 0.7, 1.5, 0.2, -0.4, 0.9],
        );
        set(&params.bias, vec![0.1, 0.2, -0.3, 0.4]);
        set(params.unary_threshold.as_ref().unwrap(), vec![1.0, 1.0]);
        set(params.binary_threshold.as_ref().unwrap(), vec![1.0]);

        let x = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &device()).unwrap();
        let y = layer.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();

        // affine = x · W + b
        let affine = [
            1.0 * 0.5 + 2.0 * 1.5 + 0.1,
            1.0 * -1.0 + 2.0 * 0.2 + 0.2,
            1.0 * 0.3 + 2.0 * -0.4 - 0.3,
            1.0 * 0.7 + 2.0 * 0.9 + 0.4,
        ];
        assert!((y[0] - affine[0]).abs() < 1e-5);
        assert!((y[1] - affine[1]).abs() < 1e-5);
        assert!((y[2] - (affine[2] + affine[3])).abs() < 1e-5);
    }

    #[test]
    fn test_active_operators_apply() {
        let layer = SymbolicLayer::hidden(1, &hidden_spec(2, 1), &device()).unwrap();
        let params = layer.params();
        set(&params.weight, vec![0.5, 1.0, 2.0, -3.0]);
        set(&params.bias, vec![0.0, 0.0, 0.0, 0.0]);
        // zero bias is pruned (|0| - 0 is not > 0), which leaves the same value

        let x = Tensor::from_vec(vec![0.4f32], (1, 1), &device()).unwrap();
        let y = layer.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((y[0] - 0.2f32.sin()).abs() < 1e-5);
        assert!((y[1] - 0.4f32.exp()).abs() < 1e-5);
        assert!((y[2] - (0.8 * -1.2)).abs() < 1e-5);
    }

    #[test]
    fn test_weight_mask_prunes_small_weights() {
        let layer = SymbolicLayer::output(2, 1, &device()).unwrap();
        let params = layer.params();
        set(&params.weight, vec![0.05, 2.0]);
        set(&params.bias, vec![0.5]);
        set(&params.weight_threshold, vec![0.1, 0.1]);
        set(&params.bias_threshold, vec![1.0]);

        let x = Tensor::from_vec(vec![10.0f32, 1.0], (1, 2), &device()).unwrap();
        let y = layer.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((y[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_layer_slots() {
        let layer = SymbolicLayer::output(3, 2, &device()).unwrap();
        assert_eq!(layer.role(), LayerRole::Output);
        assert_eq!(layer.menu(), &OperatorMenu::identity());
        assert_eq!(layer.params().slots(), ParamSlot::ALL[..4].to_vec());
        assert_eq!(layer.trainable_vars().len(), 4);

        let hidden = SymbolicLayer::hidden(3, &hidden_spec(2, 1), &device()).unwrap();
        assert_eq!(hidden.params().slots(), ParamSlot::ALL.to_vec());
        assert_eq!(hidden.trainable_vars().len(), 6);
    }

    #[test]
    fn test_constraints() {
        let layer = SymbolicLayer::hidden(1, &hidden_spec(1, 1), &device()).unwrap();
        let params = layer.params();
        set(&params.weight_threshold, vec![-0.5, 0.25, -2.0]);
        set(params.unary_threshold.as_ref().unwrap(), vec![1.7]);
        set(params.binary_threshold.as_ref().unwrap(), vec![-0.1]);
        layer.apply_constraints().unwrap();

        assert_eq!(
            params.weight_threshold.as_tensor().to_vec2::<f32>().unwrap(),
            vec![vec![0.5, 0.25, 2.0]]
        );
        assert_eq!(
            params.unary_threshold.as_ref().unwrap().as_tensor().to_vec1::<f32>().unwrap(),
            vec![1.0]
        );
        assert_eq!(
            params.binary_threshold.as_ref().unwrap().as_tensor().to_vec1::<f32>().unwrap(),
            vec![0.0]
        );
    }
}
