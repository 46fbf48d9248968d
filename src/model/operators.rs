//! Operator Vocabulary
//!
//! The closed set of unary and binary operators a symbolic layer can place on
//! its units, and the per-layer menus that assign them.
//!
//! | Operator   | Definition              | Fallback when pruned |
//! |------------|-------------------------|----------------------|
//! | `gauss`    | `exp(-x²)`              | identity             |
//! | `log`      | `log(0.001 + |x|)`      | identity             |
//! | `divide`   | `x / (0.001 + |y|)`     | `x + y`              |
//! | others     | the usual function      | identity / `x + y`   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SymbolicError;

/// Offset added inside `log` and under `divide` to keep them finite at zero
pub const OPERATOR_EPSILON: f64 = 0.001;

/// Single-argument operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Identity,
    Sin,
    Cos,
    Exp,
    Gauss,
    Sinh,
    Cosh,
    Tanh,
    Square,
    Cube,
    Log,
}

impl UnaryOp {
    /// Every unary operator, in vocabulary order
    pub fn all() -> &'static [UnaryOp] {
        &[
            Self::Identity,
            Self::Sin,
            Self::Cos,
            Self::Exp,
            Self::Gauss,
            Self::Sinh,
            Self::Cosh,
            Self::Tanh,
            Self::Square,
            Self::Cube,
            Self::Log,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Exp => "exp",
            Self::Gauss => "gauss",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Square => "square",
            Self::Cube => "cube",
            Self::Log => "log",
        }
    }

    /// Evaluate on a plain number
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Exp => x.exp(),
            Self::Gauss => (-x * x).exp(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
            Self::Square => x * x,
            Self::Cube => x * x * x,
            Self::Log => (OPERATOR_EPSILON + x.abs()).ln(),
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for UnaryOp {
    type Err = SymbolicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::all()
            .iter()
            .find(|op| op.name() == name)
            .copied()
            .ok_or_else(|| SymbolicError::Config(format!("unknown unary operator '{}'", s)))
    }
}

/// Two-argument operators, fed by consecutive units of the affine output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    #[serde(alias = "+")]
    Add,
    #[serde(alias = "*", alias = "mul")]
    Multiply,
    #[serde(alias = "pow")]
    Power,
    #[serde(alias = "/", alias = "div")]
    Divide,
}

impl BinaryOp {
    /// Every binary operator, in vocabulary order
    pub fn all() -> &'static [BinaryOp] {
        &[Self::Add, Self::Multiply, Self::Power, Self::Divide]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Power => "power",
            Self::Divide => "divide",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Multiply => "*",
            Self::Power => "pow",
            Self::Divide => "/",
        }
    }

    /// Evaluate on plain numbers
    pub fn apply(&self, x: f64, y: f64) -> f64 {
        match self {
            Self::Add => x + y,
            Self::Multiply => x * y,
            Self::Power => x.powf(y),
            Self::Divide => x / (OPERATOR_EPSILON + y.abs()),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BinaryOp {
    type Err = SymbolicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "add" | "+" => Ok(Self::Add),
            "multiply" | "mul" | "*" => Ok(Self::Multiply),
            "power" | "pow" => Ok(Self::Power),
            "divide" | "div" | "/" => Ok(Self::Divide),
            _ => Err(SymbolicError::Config(format!(
                "unknown binary operator '{}'",
                s
            ))),
        }
    }
}

/// Ordered operator lists for one layer
///
/// Unit `i` gets `unary[i % unary.len()]`, binary pair `j` gets
/// `binary[j % binary.len()]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorMenu {
    pub unary: Vec<UnaryOp>,
    #[serde(default)]
    pub binary: Vec<BinaryOp>,
}

impl OperatorMenu {
    pub fn new(unary: Vec<UnaryOp>, binary: Vec<BinaryOp>) -> Self {
        Self { unary, binary }
    }

    /// The menu of the terminal layer: identity only, no binary operators
    pub fn identity() -> Self {
        Self {
            unary: vec![UnaryOp::Identity],
            binary: Vec::new(),
        }
    }

    /// Operator assigned to unary unit `unit`
    pub fn unary_for(&self, unit: usize) -> Option<UnaryOp> {
        if self.unary.is_empty() {
            return None;
        }
        Some(self.unary[unit % self.unary.len()])
    }

    /// Operator assigned to binary pair `pair`
    pub fn binary_for(&self, pair: usize) -> Option<BinaryOp> {
        if self.binary.is_empty() {
            return None;
        }
        Some(self.binary[pair % self.binary.len()])
    }

    /// Parse comma-separated operator names, e.g. `"sin,exp"` and `"+,*"`
    pub fn parse(unary: &str, binary: &str) -> crate::Result<Self> {
        let unary = unary
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(UnaryOp::from_str)
            .collect::<crate::Result<Vec<_>>>()?;
        let binary = binary
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(BinaryOp::from_str)
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { unary, binary })
    }
}

impl fmt::Display for OperatorMenu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unary: Vec<&str> = self.unary.iter().map(|op| op.name()).collect();
        let binary: Vec<&str> = self.binary.iter().map(|op| op.symbol()).collect();
        write!(f, "[{}] / [{}]", unary.join(", "), binary.join(", "))
    }
}
