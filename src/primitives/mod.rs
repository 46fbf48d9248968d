//! Tensor Primitives
//!
//! Masking step function, activations, losses and device selection.
//!
//! ## Submodules
//!
//! - [`step`]: Hard step with a surrogate gradient (the masking primitive)
//! - [`tensor_ops`]: Device selection and loss functions
//! - [`activations`]: Sigmoid head and the 0.5 decision rule

mod activations;
mod step;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use step::*;
pub use tensor_ops::*;
