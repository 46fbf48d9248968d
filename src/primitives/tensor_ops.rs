//! Core Tensor Operations
//!
//! Device selection and the loss used by the training controller.
//!
//! ## Device Selection
//!
//! Training is sequential and single-model, so one device is picked up front
//! and every tensor of a model lives on it. GPU use can be switched off:
//!
//! ```bash
//! export NEURAL_SR_NO_GPU=1
//! ```

use crate::{Result, SymbolicError};
use candle_core::{DType, Device, Tensor};
use tracing::info;

/// Clamp applied to predictions before taking logarithms
pub const BCE_EPSILON: f32 = 1e-7;

/// Check if GPU is disabled via environment variable.
///
/// Set `NEURAL_SR_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("NEURAL_SR_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `NEURAL_SR_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("Using CPU device (NEURAL_SR_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("Using CUDA device");
            return device;
        }
    }

    info!("Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

/// Binary cross-entropy loss
///
/// BCE = -mean[y * log(p) + (1-y) * log(1-p)], with `p` clamped to
/// `[ε, 1-ε]`. Computed in the prediction dtype.
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred_clamped = pred
        .clamp(BCE_EPSILON, 1.0 - BCE_EPSILON)
        .map_err(|e| SymbolicError::Tensor(format!("Clamp failed: {}", e)))?;
    let log_p = pred_clamped
        .log()
        .map_err(|e| SymbolicError::Tensor(format!("Log failed: {}", e)))?;

    // ones_like keeps the dtype (a 1.0 literal would promote to F64)
    let ones = Tensor::ones_like(&pred_clamped)
        .map_err(|e| SymbolicError::Tensor(format!("ones_like failed: {}", e)))?;
    let one_minus_pred = (&ones - &pred_clamped)
        .map_err(|e| SymbolicError::Tensor(format!("1-pred failed: {}", e)))?;
    let log_1_p = one_minus_pred
        .log()
        .map_err(|e| SymbolicError::Tensor(format!("Log 1-p failed: {}", e)))?;

    let target = target
        .to_dtype(pred.dtype())
        .map_err(|e| SymbolicError::Tensor(format!("BCE target cast failed: {}", e)))?;
    let term1 = target
        .mul(&log_p)
        .map_err(|e| SymbolicError::Tensor(format!("BCE term1 failed: {}", e)))?;

    let one_minus_target = (&ones - &target)
        .map_err(|e| SymbolicError::Tensor(format!("1-target failed: {}", e)))?;
    let term2 = one_minus_target
        .mul(&log_1_p)
        .map_err(|e| SymbolicError::Tensor(format!("BCE term2 failed: {}", e)))?;

    let loss = (term1 + term2)?;
    loss.neg()
        .and_then(|t| t.mean_all())
        .map_err(|e| SymbolicError::Tensor(format!("BCE mean failed: {}", e)))
}

/// Binary cross-entropy promoted to F64 for loss assembly
pub fn binary_cross_entropy_f64(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    binary_cross_entropy(pred, target)?
        .to_dtype(DType::F64)
        .map_err(|e| SymbolicError::Tensor(format!("BCE f64 cast failed: {}", e)))
}

/// Read a scalar tensor of any float dtype as f64
pub fn scalar_f64(tensor: &Tensor) -> Result<f64> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(|e| SymbolicError::Tensor(format!("scalar read failed: {}", e)))
}

/// Flatten a tensor of any float dtype into f64 values
pub fn values_f64(tensor: &Tensor) -> Result<Vec<f64>> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F64))
        .and_then(|t| t.to_vec1::<f64>())
        .map_err(|e| SymbolicError::Tensor(format!("value read failed: {}", e)))
}
