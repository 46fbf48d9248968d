//! Expression Trees
//!
//! A small algebraic expression type covering what extraction produces:
//! numbers, input symbols `x{i}`, sums, products, powers and the elementary
//! functions of the operator vocabulary.
//!
//! Construction goes through smart constructors ([`Expr::add`],
//! [`Expr::mul`], [`Expr::pow`], [`Expr::func`]) that keep every tree in a
//! simplified canonical form:
//!
//! - numbers are folded, functions of numbers are evaluated
//! - nested sums and products are flattened
//! - like terms are collected (`2*x0 + 3*x0 → 5*x0`), equal bases merge
//!   their exponents (`x0*x0 → x0**2`)
//! - zero terms and unit factors disappear
//! - a numeric coefficient is distributed over a single sum
//!   (`2*(x0 + 1) → 2*x0 + 2`)
//!
//! Terms and factors are ordered by their printed form, so two
//! constructions of the same expression print identically.

use std::collections::HashMap;
use std::fmt;
use std::ops;

/// Elementary functions appearing in extracted expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Func {
    Sin,
    Cos,
    Exp,
    Sinh,
    Cosh,
    Tanh,
    Log,
    Abs,
}

impl Func {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Exp => "exp",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Log => "log",
            Self::Abs => "Abs",
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Exp => x.exp(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
            Self::Log => x.ln(),
            Self::Abs => x.abs(),
        }
    }
}

/// Simplified algebraic expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    /// Input feature `x{i}`
    Sym(usize),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Func(Func, Box<Expr>),
}

fn normalize(value: f64) -> f64 {
    // -0.0 prints as "-0"
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Round to `digits` significant digits
pub fn round_significant(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return normalize(value);
    }
    let magnitude = value.abs().log10().floor() as i32;
    let shift = digits as i32 - 1 - magnitude;
    let rounded = if shift >= 0 {
        let factor = 10f64.powi(shift);
        (value * factor).round() / factor
    } else {
        let factor = 10f64.powi(-shift);
        (value / factor).round() * factor
    };
    normalize(rounded)
}

impl Expr {
    pub fn num(value: f64) -> Self {
        Self::Num(normalize(value))
    }

    pub fn sym(index: usize) -> Self {
        Self::Sym(index)
    }

    pub fn zero() -> Self {
        Self::Num(0.0)
    }

    pub fn one() -> Self {
        Self::Num(1.0)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_num() == Some(0.0)
    }

    fn sort_key(&self) -> String {
        self.to_string()
    }

    /// Split into numeric coefficient and the remaining factor
    fn coefficient(&self) -> (f64, Expr) {
        match self {
            Self::Num(v) => (*v, Expr::one()),
            Self::Mul(factors) => match factors.first() {
                Some(Self::Num(c)) => {
                    let rest: Vec<Expr> = factors[1..].to_vec();
                    let rest = if rest.len() == 1 {
                        rest.into_iter().next().unwrap_or_else(Expr::one)
                    } else {
                        Self::Mul(rest)
                    };
                    (*c, rest)
                }
                _ => (1.0, self.clone()),
            },
            _ => (1.0, self.clone()),
        }
    }

    /// Split into base and exponent
    fn base_exponent(&self) -> (Expr, Expr) {
        match self {
            Self::Pow(base, exponent) => ((**base).clone(), (**exponent).clone()),
            _ => (self.clone(), Expr::one()),
        }
    }

    /// Sum with constant folding and like-term collection
    pub fn add(terms: Vec<Expr>) -> Expr {
        let mut constant = 0.0;
        // (key, coefficient, rest) in first-seen order
        let mut collected: Vec<(String, f64, Expr)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut pending = terms;
        while let Some(term) = pending.pop() {
            match term {
                Self::Num(v) => constant += v,
                Self::Add(inner) => pending.extend(inner),
                other => {
                    let (coefficient, rest) = other.coefficient();
                    let key = rest.sort_key();
                    match index.get(&key) {
                        Some(&i) => collected[i].1 += coefficient,
                        None => {
                            index.insert(key.clone(), collected.len());
                            collected.push((key, coefficient, rest));
                        }
                    }
                }
            }
        }

        collected.sort_by(|a, b| a.0.cmp(&b.0));
        let mut result: Vec<Expr> = collected
            .into_iter()
            .filter(|(_, coefficient, _)| *coefficient != 0.0)
            .map(|(_, coefficient, rest)| Expr::mul(vec![Expr::num(coefficient), rest]))
            .collect();
        if constant != 0.0 || !constant.is_finite() {
            result.push(Expr::num(constant));
        }

        match result.len() {
            0 => Expr::zero(),
            1 => result.pop().unwrap_or_else(Expr::zero),
            _ => Self::Add(result),
        }
    }

    /// Product with constant folding and exponent merging
    pub fn mul(factors: Vec<Expr>) -> Expr {
        let mut coefficient = 1.0;
        // (key, base, exponents) in first-seen order
        let mut collected: Vec<(String, Expr, Vec<Expr>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut pending = factors;
        while let Some(factor) = pending.pop() {
            match factor {
                Self::Num(v) => coefficient *= v,
                Self::Mul(inner) => pending.extend(inner),
                other => {
                    let (base, exponent) = other.base_exponent();
                    let key = base.sort_key();
                    match index.get(&key) {
                        Some(&i) => collected[i].2.push(exponent),
                        None => {
                            index.insert(key.clone(), collected.len());
                            collected.push((key, base, vec![exponent]));
                        }
                    }
                }
            }
        }

        if coefficient == 0.0 {
            return Expr::zero();
        }

        collected.sort_by(|a, b| a.0.cmp(&b.0));
        let mut rest: Vec<Expr> = Vec::with_capacity(collected.len());
        for (_, base, exponents) in collected {
            let merged = if exponents.len() == 1 {
                Expr::pow(base, exponents.into_iter().next().unwrap_or_else(Expr::one))
            } else {
                Expr::pow(base, Expr::add(exponents))
            };
            match merged {
                Self::Num(v) => coefficient *= v,
                Self::Mul(inner) => rest.extend(inner),
                other => rest.push(other),
            }
        }

        if coefficient == 0.0 {
            return Expr::zero();
        }
        if rest.is_empty() {
            return Expr::num(coefficient);
        }
        if coefficient == 1.0 && rest.len() == 1 {
            return rest.pop().unwrap_or_else(Expr::one);
        }
        if rest.len() == 1 {
            if let Self::Add(terms) = &rest[0] {
                return Expr::add(
                    terms
                        .iter()
                        .map(|t| Expr::mul(vec![Expr::num(coefficient), t.clone()]))
                        .collect(),
                );
            }
        }

        rest.sort_by_cached_key(Expr::sort_key);
        let mut out = Vec::with_capacity(rest.len() + 1);
        if coefficient != 1.0 {
            out.push(Expr::num(coefficient));
        }
        out.extend(rest);
        if out.len() == 1 {
            return out.pop().unwrap_or_else(Expr::one);
        }
        Self::Mul(out)
    }

    pub fn pow(base: Expr, exponent: Expr) -> Expr {
        match (&base, &exponent) {
            (_, Self::Num(e)) if *e == 0.0 => return Expr::one(),
            (_, Self::Num(e)) if *e == 1.0 => return base,
            (Self::Num(b), _) if *b == 1.0 => return Expr::one(),
            (Self::Num(b), Self::Num(e)) => {
                let value = b.powf(*e);
                if value.is_finite() {
                    return Expr::num(value);
                }
            }
            (Self::Pow(inner_base, inner_exp), Self::Num(e)) if e.fract() == 0.0 => {
                let combined = Expr::mul(vec![(**inner_exp).clone(), exponent.clone()]);
                return Expr::pow((**inner_base).clone(), combined);
            }
            _ => {}
        }
        Self::Pow(Box::new(base), Box::new(exponent))
    }

    pub fn func(func: Func, arg: Expr) -> Expr {
        if let Self::Num(v) = arg {
            let value = func.apply(v);
            if value.is_finite() {
                return Expr::num(value);
            }
        }
        if func == Func::Abs {
            if let Self::Func(Func::Abs, _) = arg {
                return arg;
            }
        }
        Self::Func(func, Box::new(arg))
    }

    pub fn neg(self) -> Expr {
        Expr::mul(vec![Expr::num(-1.0), self])
    }

    pub fn recip(self) -> Expr {
        Expr::pow(self, Expr::num(-1.0))
    }

    /// Number of nodes in the tree; atoms count one
    pub fn node_count(&self) -> usize {
        match self {
            Self::Num(_) | Self::Sym(_) => 1,
            Self::Add(children) | Self::Mul(children) => {
                1 + children.iter().map(Expr::node_count).sum::<usize>()
            }
            Self::Pow(base, exponent) => 1 + base.node_count() + exponent.node_count(),
            Self::Func(_, arg) => 1 + arg.node_count(),
        }
    }

    /// Evaluate with `x{i} = inputs[i]`; missing inputs read as zero
    pub fn eval(&self, inputs: &[f64]) -> f64 {
        match self {
            Self::Num(v) => *v,
            Self::Sym(i) => inputs.get(*i).copied().unwrap_or(0.0),
            Self::Add(terms) => terms.iter().map(|t| t.eval(inputs)).sum(),
            Self::Mul(factors) => factors.iter().map(|f| f.eval(inputs)).product(),
            Self::Pow(base, exponent) => base.eval(inputs).powf(exponent.eval(inputs)),
            Self::Func(func, arg) => func.apply(arg.eval(inputs)),
        }
    }

    /// Rebuild with every number rounded to `digits` significant digits
    pub fn round_numbers(&self, digits: u32) -> Expr {
        match self {
            Self::Num(v) => Expr::num(round_significant(*v, digits)),
            Self::Sym(i) => Expr::sym(*i),
            Self::Add(terms) => Expr::add(terms.iter().map(|t| t.round_numbers(digits)).collect()),
            Self::Mul(factors) => {
                Expr::mul(factors.iter().map(|f| f.round_numbers(digits)).collect())
            }
            Self::Pow(base, exponent) => {
                Expr::pow(base.round_numbers(digits), exponent.round_numbers(digits))
            }
            Self::Func(func, arg) => Expr::func(*func, arg.round_numbers(digits)),
        }
    }

    /// Sorted indices of the input symbols the expression depends on
    pub fn symbols(&self) -> Vec<usize> {
        let mut found = Vec::new();
        self.collect_symbols(&mut found);
        found.sort_unstable();
        found.dedup();
        found
    }

    fn collect_symbols(&self, found: &mut Vec<usize>) {
        match self {
            Self::Num(_) => {}
            Self::Sym(i) => found.push(*i),
            Self::Add(children) | Self::Mul(children) => {
                children.iter().for_each(|c| c.collect_symbols(found))
            }
            Self::Pow(base, exponent) => {
                base.collect_symbols(found);
                exponent.collect_symbols(found);
            }
            Self::Func(_, arg) => arg.collect_symbols(found),
        }
    }

    /// Affine in the input symbols: no functions, powers or symbol products
    pub fn is_linear(&self) -> bool {
        match self {
            Self::Num(_) | Self::Sym(_) => true,
            Self::Add(terms) => terms.iter().all(Expr::is_linear),
            Self::Mul(factors) => {
                let symbolic: Vec<&Expr> = factors.iter().filter(|f| f.as_num().is_none()).collect();
                symbolic.len() <= 1 && symbolic.iter().all(|f| f.is_linear())
            }
            Self::Pow(..) | Self::Func(..) => false,
        }
    }

    fn is_negative_term(&self) -> bool {
        match self {
            Self::Num(v) => *v < 0.0,
            Self::Mul(factors) => matches!(factors.first(), Some(Self::Num(c)) if *c < 0.0),
            _ => false,
        }
    }

    fn is_atom(&self) -> bool {
        match self {
            Self::Num(v) => *v >= 0.0,
            Self::Sym(_) | Self::Func(..) => true,
            _ => false,
        }
    }
}

impl Default for Expr {
    fn default() -> Self {
        Expr::zero()
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::num(value)
    }
}

impl ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::add(vec![self, rhs])
    }
}

impl ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::add(vec![self, rhs.neg()])
    }
}

impl ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul(vec![self, rhs])
    }
}

impl ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::mul(vec![self, rhs.recip()])
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::neg(self)
    }
}

// =============================================================================
// Printing
// =============================================================================

fn write_factor(f: &mut fmt::Formatter<'_>, factor: &Expr) -> fmt::Result {
    match factor {
        Expr::Add(_) => write!(f, "({})", factor),
        Expr::Num(v) if *v < 0.0 => write!(f, "({})", factor),
        _ => write!(f, "{}", factor),
    }
}

fn write_product(f: &mut fmt::Formatter<'_>, factors: &[Expr]) -> fmt::Result {
    let mut numerator: Vec<Expr> = Vec::new();
    let mut denominator: Vec<Expr> = Vec::new();
    for factor in factors {
        match factor {
            Expr::Pow(base, exponent) if exponent.as_num().map_or(false, |e| e < 0.0) => {
                let positive = Expr::num(-exponent.as_num().unwrap_or(-1.0));
                denominator.push(Expr::pow((**base).clone(), positive));
            }
            other => numerator.push(other.clone()),
        }
    }

    if numerator.is_empty() {
        write!(f, "1")?;
    } else if let [Expr::Num(c), rest @ ..] = numerator.as_slice() {
        if *c == -1.0 && !rest.is_empty() {
            write!(f, "-")?;
            write_joined(f, rest)?;
        } else {
            write_joined(f, &numerator)?;
        }
    } else {
        write_joined(f, &numerator)?;
    }

    if !denominator.is_empty() {
        write!(f, "/")?;
        if denominator.len() == 1 {
            write_factor(f, &denominator[0])?;
        } else {
            write!(f, "(")?;
            write_joined(f, &denominator)?;
            write!(f, ")")?;
        }
    }
    Ok(())
}

fn write_joined(f: &mut fmt::Formatter<'_>, factors: &[Expr]) -> fmt::Result {
    for (i, factor) in factors.iter().enumerate() {
        if i > 0 {
            write!(f, "*")?;
        }
        if i == 0 && factor.as_num().is_some() {
            write!(f, "{}", factor)?;
        } else {
            write_factor(f, factor)?;
        }
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(v) => write!(f, "{}", v),
            Self::Sym(i) => write!(f, "x{}", i),
            Self::Add(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i == 0 {
                        write!(f, "{}", term)?;
                    } else if term.is_negative_term() {
                        write!(f, " - {}", term.clone().neg())?;
                    } else {
                        write!(f, " + {}", term)?;
                    }
                }
                Ok(())
            }
            Self::Mul(factors) => write_product(f, factors),
            Self::Pow(base, exponent) => {
                if base.is_atom() {
                    write!(f, "{}", base)?;
                } else {
                    write!(f, "({})", base)?;
                }
                write!(f, "**")?;
                if exponent.is_atom() {
                    write!(f, "{}", exponent)
                } else {
                    write!(f, "({})", exponent)
                }
            }
            Self::Func(func, arg) => write!(f, "{}({})", func.name(), arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(i: usize) -> Expr {
        Expr::sym(i)
    }

    fn n(v: f64) -> Expr {
        Expr::num(v)
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(n(2.0) + n(3.0), n(5.0));
        assert_eq!(n(2.0) * n(3.0), n(6.0));
        assert_eq!(Expr::func(Func::Exp, n(0.0)), n(1.0));
        assert_eq!(Expr::pow(n(2.0), n(3.0)), n(8.0));
    }

    #[test]
    fn test_identities() {
        assert_eq!(x(0) + n(0.0), x(0));
        assert_eq!(x(0) * n(1.0), x(0));
        assert_eq!(x(0) * n(0.0), n(0.0));
        assert_eq!(Expr::pow(x(1), n(1.0)), x(1));
        assert_eq!(Expr::pow(x(1), n(0.0)), n(1.0));
    }

    #[test]
    fn test_like_terms_collect() {
        let e = n(2.0) * x(0) + n(3.0) * x(0) + x(1);
        assert_eq!(e.to_string(), "5*x0 + x1");

        let cancelled = x(0) - x(0);
        assert_eq!(cancelled, n(0.0));
    }

    #[test]
    fn test_powers_merge() {
        assert_eq!((x(0) * x(0)).to_string(), "x0**2");
        assert_eq!((x(0) / x(0)), n(1.0));
        assert_eq!(Expr::pow(Expr::pow(x(2), n(2.0)), n(3.0)).to_string(), "x2**6");
    }

    #[test]
    fn test_coefficient_distributes() {
        let e = n(2.0) * (x(0) + n(1.0));
        assert_eq!(e.to_string(), "2*x0 + 2");
    }

    #[test]
    fn test_order_independent() {
        let a = x(1) + x(0) * n(0.5) + Expr::func(Func::Sin, x(2));
        let b = Expr::func(Func::Sin, x(2)) + n(0.5) * x(0) + x(1);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_display() {
        assert_eq!((x(0) - n(2.0) * x(1)).to_string(), "x0 - 2*x1");
        assert_eq!((-x(3)).to_string(), "-x3");
        let div = x(0) / (Expr::func(Func::Abs, x(1)) + n(0.001));
        assert_eq!(div.to_string(), "x0/(Abs(x1) + 0.001)");
        let gauss = Expr::func(Func::Exp, -Expr::pow(x(0), n(2.0)));
        assert_eq!(gauss.to_string(), "exp(-x0**2)");
        assert_eq!(n(-0.0).to_string(), "0");
    }

    #[test]
    fn test_round_significant() {
        assert_eq!(round_significant(0.012345, 2), 0.012);
        assert_eq!(round_significant(-1234.5, 2), -1200.0);
        assert_eq!(round_significant(1.25, 3), 1.25);
        assert_eq!(round_significant(0.0, 2), 0.0);
    }

    #[test]
    fn test_round_numbers_drops_vanishing_terms() {
        let e = n(0.123456) * x(0) + n(1.0004) * x(1);
        assert_eq!(e.round_numbers(2).to_string(), "0.12*x0 + x1");
    }

    #[test]
    fn test_node_count() {
        assert_eq!(x(0).node_count(), 1);
        assert_eq!(n(3.0).node_count(), 1);
        // Add(Mul(2, x0), x1)
        assert_eq!((n(2.0) * x(0) + x(1)).node_count(), 5);
        assert_eq!(Expr::func(Func::Sin, x(0)).node_count(), 2);
    }

    #[test]
    fn test_eval() {
        let e = n(2.0) * Expr::func(Func::Sin, x(0)) + x(1) / (n(0.001) + Expr::func(Func::Abs, x(2)));
        let inputs = [0.5, 3.0, -2.0];
        let expected = 2.0 * 0.5f64.sin() + 3.0 / 2.001;
        assert!((e.eval(&inputs) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_symbols_and_linearity() {
        let e = n(0.3) * x(4) + x(1) - n(2.0);
        assert_eq!(e.symbols(), vec![1, 4]);
        assert!(e.is_linear());
        assert!(!(x(0) * x(1)).is_linear());
        assert!(!Expr::func(Func::Cos, x(0)).is_linear());
    }
}
