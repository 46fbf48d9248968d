//! Masking Step Function
//!
//! Every keep/drop decision in the network goes through this primitive.
//!
//! ## Forward / Backward
//!
//! ```text
//! forward(d)  = 1 if d > 0 else 0
//! backward(d) = a · e^(-a·d) / (1 + e^(-a·d))²   = a · σ(a·d) · (1 - σ(a·d))
//! ```
//!
//! The forward value is the exact hard threshold, so a pruned slot contributes
//! nothing. The backward value is the derivative of `σ(a·d)`, which keeps a
//! gradient flowing to both the parameter and its threshold. `a` is the
//! steepness (5 by default).
//!
//! On CPU the pair is registered with candle as a custom op whose `bwd` calls
//! the surrogate. Other devices use the equivalent straight-through
//! composition `hard.detach() + σ(a·d) - σ(a·d).detach()`.

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Tensor};

use crate::{Result, SymbolicError};

/// Steepness of the surrogate sigmoid
pub const DEFAULT_STEEPNESS: f64 = 5.0;

/// A function whose gradient is replaced by a hand-written estimate
///
/// `forward` is what the network evaluates, `backward_grad` is what
/// backpropagation sees in its place.
pub trait SurrogateGradient {
    /// Value used in the forward pass
    fn forward(&self, x: f64) -> f64;

    /// Gradient contribution for input `x` given the upstream gradient
    fn backward_grad(&self, x: f64, upstream: f64) -> f64;
}

/// Hard step with a sigmoid-derivative surrogate gradient
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepFunction {
    /// Slope `a` of the surrogate `σ(a·d)`
    pub steepness: f64,
}

impl Default for StepFunction {
    fn default() -> Self {
        Self {
            steepness: DEFAULT_STEEPNESS,
        }
    }
}

impl StepFunction {
    /// Create a step function with the given surrogate steepness
    pub fn new(steepness: f64) -> Self {
        Self { steepness }
    }

    /// `a · σ(a·x) · (1 - σ(a·x))`
    pub fn surrogate_derivative(&self, x: f64) -> f64 {
        let s = 1.0 / (1.0 + (-self.steepness * x).exp());
        self.steepness * s * (1.0 - s)
    }

    /// Apply the step to a tensor, tracking the surrogate gradient
    pub fn apply(&self, signal: &Tensor) -> Result<Tensor> {
        if signal.device().is_cpu() {
            let signal = signal
                .contiguous()
                .map_err(|e| SymbolicError::Tensor(format!("step contiguous failed: {}", e)))?;
            signal
                .apply_op1(*self)
                .map_err(|e| SymbolicError::Tensor(format!("step op failed: {}", e)))
        } else {
            self.straight_through(signal)
        }
    }

    fn straight_through(&self, signal: &Tensor) -> Result<Tensor> {
        let hard = signal
            .gt(0.0)?
            .to_dtype(signal.dtype())
            .map_err(|e| SymbolicError::Tensor(format!("step hard mask failed: {}", e)))?;
        let soft = super::activations::sigmoid(&signal.affine(self.steepness, 0.0)?)?;
        let correction = (&soft - soft.detach())
            .map_err(|e| SymbolicError::Tensor(format!("step correction failed: {}", e)))?;
        (hard.detach() + correction)
            .map_err(|e| SymbolicError::Tensor(format!("step combine failed: {}", e)))
    }
}

impl SurrogateGradient for StepFunction {
    fn forward(&self, x: f64) -> f64 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    fn backward_grad(&self, x: f64, upstream: f64) -> f64 {
        upstream * self.surrogate_derivative(x)
    }
}

impl CustomOp1 for StepFunction {
    fn name(&self) -> &'static str {
        "surrogate-step"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle_core::bail!("surrogate-step expects a contiguous input"),
        };
        let out = match storage {
            CpuStorage::F32(values) => CpuStorage::F32(
                values[start..end]
                    .iter()
                    .map(|&x| self.forward(x as f64) as f32)
                    .collect(),
            ),
            CpuStorage::F64(values) => {
                CpuStorage::F64(values[start..end].iter().map(|&x| self.forward(x)).collect())
            }
            other => candle_core::bail!("surrogate-step does not support {:?}", other.dtype()),
        };
        Ok((out, layout.shape().clone()))
    }

    fn bwd(
        &self,
        arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        // σ(a·d) computed as 1 / (1 + e^(-a·d)) saturates to 0 instead of NaN
        let exp_neg = arg.affine(-self.steepness, 0.0)?.exp()?;
        let soft = (exp_neg + 1.0)?.recip()?;
        let one_minus = (soft.ones_like()? - &soft)?;
        let derivative = soft.mul(&one_minus)?.affine(self.steepness, 0.0)?;
        Ok(Some(grad_res.mul(&derivative)?))
    }
}

/// Apply the default step function: `1` where `signal > 0`, else `0`
pub fn step_mask(signal: &Tensor) -> Result<Tensor> {
    StepFunction::default().apply(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_is_hard_threshold() {
        let step = StepFunction::default();
        for &x in &[-3.0, -1e-6, 0.0, 1e-6, 0.5, 42.0] {
            let y = step.forward(x);
            assert!(y == 0.0 || y == 1.0);
            assert_eq!(y == 1.0, x > 0.0, "x = {}", x);
        }
    }

    #[test]
    fn test_surrogate_at_zero_is_quarter_steepness() {
        for &a in &[1.0, 5.0, 12.0] {
            let step = StepFunction::new(a);
            assert!((step.backward_grad(0.0, 1.0) - a / 4.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_surrogate_symmetric_and_decaying() {
        let step = StepFunction::default();
        let mut previous = step.surrogate_derivative(0.0);
        for i in 1..20 {
            let d = i as f64 * 0.25;
            let right = step.surrogate_derivative(d);
            let left = step.surrogate_derivative(-d);
            assert!(right > 0.0);
            assert!((right - left).abs() < 1e-12);
            assert!(right < previous);
            previous = right;
        }
    }

    #[test]
    fn test_backward_scales_upstream() {
        let step = StepFunction::default();
        let base = step.backward_grad(0.3, 1.0);
        assert!((step.backward_grad(0.3, -2.5) + 2.5 * base).abs() < 1e-12);
    }

    #[test]
    fn test_tensor_forward() {
        let t = tensor(&[-2.0, 0.0, 0.1, 3.0]);
        let mask = step_mask(&t).unwrap();
        assert_eq!(mask.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(mask.dims(), t.dims());
    }

    #[test]
    fn test_tensor_backward_uses_surrogate() {
        let xs = [-1.0f32, 0.0, 0.4, 2.0];
        let x = Var::from_tensor(&tensor(&xs)).unwrap();
        let loss = step_mask(x.as_tensor()).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>().unwrap();

        let step = StepFunction::default();
        for (g, &x) in grad.iter().zip(xs.iter()) {
            let expected = step.surrogate_derivative(x as f64) as f32;
            assert!((g - expected).abs() < 1e-5, "grad {} vs {}", g, expected);
        }
    }

    #[test]
    fn test_straight_through_matches_custom_op() {
        let step = StepFunction::default();
        let xs = [-0.7f32, 0.0, 0.2];
        let x = Var::from_tensor(&tensor(&xs)).unwrap();
        let hard = step.straight_through(x.as_tensor()).unwrap();
        assert_eq!(hard.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 1.0]);

        let grads = hard.sum_all().unwrap().backward().unwrap();
        let grad = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        for (g, &x) in grad.iter().zip(xs.iter()) {
            assert!((g - step.surrogate_derivative(x as f64) as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn test_non_contiguous_input() {
        let t = Tensor::from_vec(vec![1.0f32, -1.0, -1.0, 1.0], (2, 2), &Device::Cpu).unwrap();
        let mask = step_mask(&t.t().unwrap()).unwrap();
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }
}
