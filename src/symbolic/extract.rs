//! Expression extraction
//!
//! Replays a trained model on symbols instead of numbers. The same layer
//! routine the tensor forward pass uses runs on [`SymbolicAlgebra`], where
//! every mask is an exact `value - threshold > 0` comparison on the final
//! parameters, so pruned weights and operators simply never appear.

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::expr::{Expr, Func};
use crate::model::{
    evaluate, BinaryOp, EvalAlgebra, InputSparsity, LayerParams, SymbolicModel, UnaryOp,
    OPERATOR_EPSILON,
};
use crate::primitives::values_f64;
use crate::training::SparsityStats;
use crate::{Result, SymbolicError};

/// Settings for [`extract_expressions`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Significant digits kept after every affine transform and layer
    pub significant_digits: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            significant_digits: 2,
        }
    }
}

/// Closed-form view of a trained model
#[derive(Debug, Clone)]
pub struct Extraction {
    /// One pre-sigmoid expression per output unit
    pub expressions: Vec<Expr>,
    /// Node count of each expression
    pub complexity: Vec<usize>,
    pub sparsity: SparsityStats,
}

impl Extraction {
    pub fn mean_complexity(&self) -> f64 {
        if self.complexity.is_empty() {
            return 0.0;
        }
        self.complexity.iter().sum::<usize>() as f64 / self.complexity.len() as f64
    }
}

impl fmt::Display for Extraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (expr, complexity)) in self.expressions.iter().zip(&self.complexity).enumerate() {
            writeln!(f, "expr_{} (complexity = {}): {}", i, complexity, expr)?;
        }
        writeln!(f, "mean complexity = {:.2}", self.mean_complexity())?;
        write!(f, "{}", self.sparsity)
    }
}

/// Exact evaluation on expressions
#[derive(Debug, Clone, Copy)]
pub struct SymbolicAlgebra {
    digits: u32,
}

impl SymbolicAlgebra {
    pub fn new(digits: u32) -> Self {
        Self { digits }
    }

    fn round(&self, expr: &Expr) -> Expr {
        expr.round_numbers(self.digits)
    }
}

/// `reference - threshold > 0` per slot
fn keep_mask(reference: &Tensor, threshold: &Tensor) -> Result<Vec<bool>> {
    let reference = values_f64(reference)?;
    let threshold = values_f64(threshold)?;
    if reference.len() != threshold.len() {
        return Err(SymbolicError::Tensor(format!(
            "{} reference values but {} thresholds",
            reference.len(),
            threshold.len()
        )));
    }
    Ok(reference
        .iter()
        .zip(&threshold)
        .map(|(r, t)| r - t > 0.0)
        .collect())
}

impl EvalAlgebra for SymbolicAlgebra {
    type Row = Vec<Expr>;
    type Unit = Expr;
    type Gate = bool;

    fn mask_inputs(&self, row: &Vec<Expr>, input: &InputSparsity) -> Result<Vec<Expr>> {
        let keep = keep_mask(&input.reference, input.threshold.as_tensor())?;
        if keep.len() != row.len() {
            return Err(SymbolicError::Tensor(format!(
                "{} input symbols for {} input features",
                row.len(),
                keep.len()
            )));
        }
        Ok(row
            .iter()
            .zip(keep)
            .map(|(x, keep)| if keep { x.clone() } else { Expr::zero() })
            .collect())
    }

    fn masked_affine(&self, row: &Vec<Expr>, params: &LayerParams) -> Result<Vec<Expr>> {
        let (inputs, units) = params
            .weight
            .as_tensor()
            .dims2()
            .map_err(|e| SymbolicError::Tensor(format!("weight shape failed: {}", e)))?;
        if row.len() != inputs {
            return Err(SymbolicError::Tensor(format!(
                "layer expects {} inputs, got {}",
                inputs,
                row.len()
            )));
        }
        let weight = values_f64(params.weight.as_tensor())?;
        let weight_threshold = values_f64(params.weight_threshold.as_tensor())?;
        let bias = values_f64(params.bias.as_tensor())?;
        let bias_threshold = values_f64(params.bias_threshold.as_tensor())?;

        let mut out = Vec::with_capacity(units);
        for j in 0..units {
            let mut terms = Vec::new();
            for (i, x) in row.iter().enumerate() {
                let k = i * units + j;
                if weight[k].abs() - weight_threshold[k] > 0.0 && !x.is_zero() {
                    terms.push(Expr::mul(vec![Expr::num(weight[k]), x.clone()]));
                }
            }
            if bias[j].abs() - bias_threshold[j] > 0.0 {
                terms.push(Expr::num(bias[j]));
            }
            out.push(self.round(&Expr::add(terms)));
        }
        Ok(out)
    }

    fn split(&self, row: &Vec<Expr>) -> Result<Vec<Expr>> {
        Ok(row.clone())
    }

    fn join(&self, units: Vec<Expr>) -> Result<Vec<Expr>> {
        Ok(units.iter().map(|u| self.round(u)).collect())
    }

    fn gates(&self, reference: &Tensor, threshold: &Tensor) -> Result<Vec<bool>> {
        keep_mask(reference, threshold)
    }

    fn add(&self, a: &Expr, b: &Expr) -> Result<Expr> {
        Ok(Expr::add(vec![a.clone(), b.clone()]))
    }

    fn unary(&self, op: UnaryOp, x: &Expr) -> Result<Expr> {
        let x = x.clone();
        Ok(match op {
            UnaryOp::Identity => x,
            UnaryOp::Sin => Expr::func(Func::Sin, x),
            UnaryOp::Cos => Expr::func(Func::Cos, x),
            UnaryOp::Exp => Expr::func(Func::Exp, x),
            UnaryOp::Gauss => Expr::func(Func::Exp, Expr::pow(x, Expr::num(2.0)).neg()),
            UnaryOp::Sinh => Expr::func(Func::Sinh, x),
            UnaryOp::Cosh => Expr::func(Func::Cosh, x),
            UnaryOp::Tanh => Expr::func(Func::Tanh, x),
            UnaryOp::Square => Expr::pow(x, Expr::num(2.0)),
            UnaryOp::Cube => Expr::pow(x, Expr::num(3.0)),
            UnaryOp::Log => Expr::func(
                Func::Log,
                Expr::add(vec![Expr::func(Func::Abs, x), Expr::num(OPERATOR_EPSILON)]),
            ),
        })
    }

    fn binary(&self, op: BinaryOp, x: &Expr, y: &Expr) -> Result<Expr> {
        let (x, y) = (x.clone(), y.clone());
        Ok(match op {
            BinaryOp::Add => Expr::add(vec![x, y]),
            BinaryOp::Multiply => Expr::mul(vec![x, y]),
            BinaryOp::Power => Expr::pow(x, y),
            BinaryOp::Divide => {
                let denominator =
                    Expr::add(vec![Expr::func(Func::Abs, y), Expr::num(OPERATOR_EPSILON)]);
                Expr::mul(vec![x, denominator.recip()])
            }
        })
    }

    fn blend(&self, gate: &bool, active: Expr, fallback: Expr) -> Result<Expr> {
        Ok(if *gate { active } else { fallback })
    }
}

/// Collapse a trained model into one expression per output unit
///
/// Inputs are the symbols `x0..x{n-1}`; outputs are pre-sigmoid logits.
pub fn extract_expressions(model: &SymbolicModel, config: &ExtractConfig) -> Result<Extraction> {
    let algebra = SymbolicAlgebra::new(config.significant_digits);
    let symbols: Vec<Expr> = (0..model.config().input_dim).map(Expr::sym).collect();

    let expressions = evaluate(&algebra, model.input_sparsity(), model.layers(), &symbols)?;
    let complexity: Vec<usize> = expressions.iter().map(Expr::node_count).collect();
    let sparsity = SparsityStats::from_model(model)?;

    for (i, expr) in expressions.iter().enumerate() {
        debug!("expr_{} uses inputs {:?}", i, expr.symbols());
    }
    let extraction = Extraction {
        expressions,
        complexity,
        sparsity,
    };
    info!(
        "Extracted {} expressions (mean complexity {:.2})",
        extraction.expressions.len(),
        extraction.mean_complexity()
    );
    Ok(extraction)
}
