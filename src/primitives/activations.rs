//! Activation Functions
//!
//! The sigmoid head of the classifier and the decision rule applied to its output.

use crate::{Result, SymbolicError};
use candle_core::{DType, Tensor};

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps the pre-activation of the output layer to a class probability.
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor
        .neg()
        .map_err(|e| SymbolicError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg
        .exp()
        .map_err(|e| SymbolicError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| SymbolicError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus
        .recip()
        .map_err(|e| SymbolicError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Round probabilities to hard class decisions
///
/// A probability of exactly 0.5 counts as positive (round half up). The
/// result keeps the input dtype.
pub fn round_half_up(probabilities: &Tensor) -> Result<Tensor> {
    probabilities
        .ge(0.5)
        .and_then(|mask| mask.to_dtype(probabilities.dtype()))
        .map_err(|e| SymbolicError::Tensor(format!("round_half_up failed: {}", e)))
}

/// Count predictions that agree with the labels
///
/// Predictions are rounded half up, labels are positive when `> 0.5`.
/// Returns `(correct, total)`.
pub fn count_correct(probabilities: &Tensor, labels: &Tensor) -> Result<(usize, usize)> {
    let predicted = round_half_up(probabilities)?
        .to_dtype(DType::U8)
        .map_err(|e| SymbolicError::Tensor(format!("prediction cast failed: {}", e)))?;
    let actual = labels
        .gt(0.5)
        .map_err(|e| SymbolicError::Tensor(format!("label threshold failed: {}", e)))?;
    let agree = predicted
        .eq(&actual)
        .and_then(|t| t.to_dtype(DType::F64))
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(|e| SymbolicError::Tensor(format!("accuracy count failed: {}", e)))?;
    Ok((agree as usize, labels.elem_count()))
}
