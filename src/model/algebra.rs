//! Evaluation Algebra
//!
//! The masking-and-operator logic of a layer written once, generic over what
//! a "value" is. [`TensorAlgebra`] runs it on batched tensors with the
//! surrogate-gradient step; the expression extractor runs the same routine
//! on symbolic expressions with exact comparisons.

use candle_core::{Tensor, D};

use super::layers::{InputSparsity, LayerParams, LayerRole, SymbolicLayer};
use super::operators::{BinaryOp, UnaryOp, OPERATOR_EPSILON};
use crate::primitives::StepFunction;
use crate::{Result, SymbolicError};

/// Capability set needed to evaluate a symbolic layer
///
/// - `Row`: a whole layer activation (a batch of rows, or a vector of expressions)
/// - `Unit`: the value of one unit
/// - `Gate`: a keep/drop decision for one operator slot
pub trait EvalAlgebra {
    type Row;
    type Unit: Clone;
    type Gate;

    /// Gate every input feature by `step(1 - threshold)`
    fn mask_inputs(&self, row: &Self::Row, input: &InputSparsity) -> Result<Self::Row>;

    /// `row · (W ⊙ step(|W| - Wt)) + b ⊙ step(|b| - bt)`
    fn masked_affine(&self, row: &Self::Row, params: &LayerParams) -> Result<Self::Row>;

    /// Break a row into its units
    fn split(&self, row: &Self::Row) -> Result<Vec<Self::Unit>>;

    /// Reassemble units into a row
    fn join(&self, units: Vec<Self::Unit>) -> Result<Self::Row>;

    /// One gate per slot of `reference - threshold`
    fn gates(&self, reference: &Tensor, threshold: &Tensor) -> Result<Vec<Self::Gate>>;

    fn add(&self, a: &Self::Unit, b: &Self::Unit) -> Result<Self::Unit>;

    fn unary(&self, op: UnaryOp, x: &Self::Unit) -> Result<Self::Unit>;

    fn binary(&self, op: BinaryOp, x: &Self::Unit, y: &Self::Unit) -> Result<Self::Unit>;

    /// `gate · active + (1 - gate) · fallback`
    fn blend(&self, gate: &Self::Gate, active: Self::Unit, fallback: Self::Unit)
        -> Result<Self::Unit>;
}

fn missing(layer: &SymbolicLayer, what: &str) -> SymbolicError {
    SymbolicError::Config(format!(
        "hidden layer with {} unary units has no {}",
        layer.num_unary(),
        what
    ))
}

/// Evaluate one symbolic layer
///
/// The terminal layer stops after the masked affine transform. Hidden layers
/// apply unary operators to the first `num_unary` units and binary operators
/// to the following pairs, each blended with its fallback by its gate.
pub fn apply_layer<A: EvalAlgebra>(
    algebra: &A,
    layer: &SymbolicLayer,
    row: &A::Row,
) -> Result<A::Row> {
    let params = layer.params();
    let affine = algebra.masked_affine(row, params)?;
    if layer.role() == LayerRole::Output {
        return Ok(affine);
    }

    let units = algebra.split(&affine)?;
    if units.len() != layer.affine_units() {
        return Err(SymbolicError::Tensor(format!(
            "layer produced {} units, expected {}",
            units.len(),
            layer.affine_units()
        )));
    }
    let menu = layer.menu();
    let mut outputs = Vec::with_capacity(layer.output_units());

    let unary_ref = params
        .unary_ref
        .as_ref()
        .ok_or_else(|| missing(layer, "unary reference"))?;
    let unary_threshold = params
        .unary_threshold
        .as_ref()
        .ok_or_else(|| missing(layer, "unary threshold"))?;
    let unary_gates = algebra.gates(unary_ref, unary_threshold.as_tensor())?;

    for (i, gate) in unary_gates.iter().enumerate() {
        let op = menu
            .unary_for(i)
            .ok_or_else(|| missing(layer, "unary operators"))?;
        let x = &units[i];
        let active = algebra.unary(op, x)?;
        outputs.push(algebra.blend(gate, active, x.clone())?);
    }

    if layer.num_binary() > 0 {
        let binary_ref = params
            .binary_ref
            .as_ref()
            .ok_or_else(|| missing(layer, "binary reference"))?;
        let binary_threshold = params
            .binary_threshold
            .as_ref()
            .ok_or_else(|| missing(layer, "binary threshold"))?;
        let binary_gates = algebra.gates(binary_ref, binary_threshold.as_tensor())?;

        for (j, gate) in binary_gates.iter().enumerate() {
            let op = menu
                .binary_for(j)
                .ok_or_else(|| missing(layer, "binary operators"))?;
            let x = &units[layer.num_unary() + 2 * j];
            let y = &units[layer.num_unary() + 2 * j + 1];
            let active = algebra.binary(op, x, y)?;
            let fallback = algebra.add(x, y)?;
            outputs.push(algebra.blend(gate, active, fallback)?);
        }
    }

    algebra.join(outputs)
}

/// Evaluate input sparsity followed by every layer in order
pub fn evaluate<A: EvalAlgebra>(
    algebra: &A,
    input: &InputSparsity,
    layers: &[SymbolicLayer],
    row: &A::Row,
) -> Result<A::Row> {
    let mut current = algebra.mask_inputs(row, input)?;
    for layer in layers {
        current = apply_layer(algebra, layer, &current)?;
    }
    Ok(current)
}

// =============================================================================
// Tensor instance
// =============================================================================

/// Batched numeric evaluation with surrogate-gradient masks
///
/// Rows are `(batch, units)` tensors, units are `(batch, 1)` columns and gates
/// are scalar-shaped `(1,)` masks broadcast over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorAlgebra {
    pub step: StepFunction,
}

impl TensorAlgebra {
    pub fn new(step: StepFunction) -> Self {
        Self { step }
    }

    /// `step(|value| - threshold)`
    fn magnitude_mask(&self, value: &Tensor, threshold: &Tensor) -> Result<Tensor> {
        let signal = value
            .abs()
            .and_then(|m| m - threshold)
            .map_err(|e| SymbolicError::Tensor(format!("magnitude signal failed: {}", e)))?;
        self.step.apply(&signal)
    }

    /// `step(reference - threshold)`
    fn reference_mask(&self, reference: &Tensor, threshold: &Tensor) -> Result<Tensor> {
        let signal = (reference - threshold)
            .map_err(|e| SymbolicError::Tensor(format!("reference signal failed: {}", e)))?;
        self.step.apply(&signal)
    }
}

impl EvalAlgebra for TensorAlgebra {
    type Row = Tensor;
    type Unit = Tensor;
    type Gate = Tensor;

    fn mask_inputs(&self, row: &Tensor, input: &InputSparsity) -> Result<Tensor> {
        let mask = self.reference_mask(&input.reference, input.threshold.as_tensor())?;
        row.broadcast_mul(&mask)
            .map_err(|e| SymbolicError::Tensor(format!("input mask failed: {}", e)))
    }

    fn masked_affine(&self, row: &Tensor, params: &LayerParams) -> Result<Tensor> {
        let weight = params.weight.as_tensor();
        let bias = params.bias.as_tensor();
        let weight_mask = self.magnitude_mask(weight, params.weight_threshold.as_tensor())?;
        let bias_mask = self.magnitude_mask(bias, params.bias_threshold.as_tensor())?;

        let masked_weight = weight
            .mul(&weight_mask)
            .map_err(|e| SymbolicError::Tensor(format!("weight mask failed: {}", e)))?;
        let masked_bias = bias
            .mul(&bias_mask)
            .map_err(|e| SymbolicError::Tensor(format!("bias mask failed: {}", e)))?;

        row.matmul(&masked_weight)
            .and_then(|t| t.broadcast_add(&masked_bias))
            .map_err(|e| SymbolicError::Tensor(format!("affine transform failed: {}", e)))
    }

    fn split(&self, row: &Tensor) -> Result<Vec<Tensor>> {
        let units = row
            .dim(D::Minus1)
            .map_err(|e| SymbolicError::Tensor(format!("unit count failed: {}", e)))?;
        (0..units)
            .map(|i| {
                row.narrow(D::Minus1, i, 1)
                    .map_err(|e| SymbolicError::Tensor(format!("unit {} split failed: {}", i, e)))
            })
            .collect()
    }

    fn join(&self, units: Vec<Tensor>) -> Result<Tensor> {
        Tensor::cat(&units, D::Minus1)
            .map_err(|e| SymbolicError::Tensor(format!("unit concat failed: {}", e)))
    }

    fn gates(&self, reference: &Tensor, threshold: &Tensor) -> Result<Vec<Tensor>> {
        let mask = self.reference_mask(reference, threshold)?;
        let slots = mask.elem_count();
        (0..slots)
            .map(|i| {
                mask.narrow(0, i, 1)
                    .map_err(|e| SymbolicError::Tensor(format!("gate {} failed: {}", i, e)))
            })
            .collect()
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        (a + b).map_err(|e| SymbolicError::Tensor(format!("add failed: {}", e)))
    }

    fn unary(&self, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        let result = match op {
            UnaryOp::Identity => Ok(x.clone()),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Gauss => x.sqr().and_then(|t| t.neg()).and_then(|t| t.exp()),
            UnaryOp::Sinh => {
                let pos = x.exp();
                let neg = x.neg().and_then(|t| t.exp());
                pos.and_then(|p| neg.and_then(|n| (p - n)?.affine(0.5, 0.0)))
            }
            UnaryOp::Cosh => {
                let pos = x.exp();
                let neg = x.neg().and_then(|t| t.exp());
                pos.and_then(|p| neg.and_then(|n| (p + n)?.affine(0.5, 0.0)))
            }
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Square => x.sqr(),
            UnaryOp::Cube => x.sqr().and_then(|sq| sq.mul(x)),
            UnaryOp::Log => x
                .abs()
                .and_then(|t| t.affine(1.0, OPERATOR_EPSILON))
                .and_then(|t| t.log()),
        };
        result.map_err(|e| SymbolicError::Tensor(format!("{} failed: {}", op, e)))
    }

    fn binary(&self, op: BinaryOp, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let result = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Multiply => x * y,
            BinaryOp::Power => x.pow(y),
            BinaryOp::Divide => y
                .abs()
                .and_then(|t| t.affine(1.0, OPERATOR_EPSILON))
                .and_then(|denominator| x / denominator),
        };
        result.map_err(|e| SymbolicError::Tensor(format!("{} failed: {}", op, e)))
    }

    fn blend(&self, gate: &Tensor, active: Tensor, fallback: Tensor) -> Result<Tensor> {
        let keep = active
            .broadcast_mul(gate)
            .map_err(|e| SymbolicError::Tensor(format!("gate active failed: {}", e)))?;
        let dropped = gate
            .ones_like()
            .and_then(|ones| ones - gate)
            .and_then(|inverse| fallback.broadcast_mul(&inverse))
            .map_err(|e| SymbolicError::Tensor(format!("gate fallback failed: {}", e)))?;
        (keep + dropped).map_err(|e| SymbolicError::Tensor(format!("gate blend failed: {}", e)))
    }
}
