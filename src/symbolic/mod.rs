//! Symbolic Expressions
//!
//! The expression type and the post-training extractor that turns a model
//! into closed-form formulas over its input bits.

mod expr;
mod extract;

pub use expr::{round_significant, Expr, Func};
pub use extract::{extract_expressions, ExtractConfig, Extraction, SymbolicAlgebra};
