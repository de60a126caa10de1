//! Expression values and evaluation.
//!
//! Expression operands drawn from variables are always stored as text; the
//! coercion rule interprets them as integer, then float, then boolean
//! (`True`/`False`), and otherwise leaves them as text. Arithmetic follows
//! Python semantics: `/` is float division, `//` floors toward negative
//! infinity, `%` takes the sign of the divisor, and comparisons chain.

use crate::errors::{ResolveError, Result};
use crate::vars::key::VarKey;

use super::functions::FunctionRegistry;
use super::VarLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Var(VarKey),
    List(Vec<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Chained Python-style comparison: `a < b <= c`.
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// The result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<ExprValue>),
}

impl ExprValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Int(_) => "int",
            ExprValue::Float(_) => "float",
            ExprValue::Bool(_) => "bool",
            ExprValue::Str(_) => "string",
            ExprValue::List(_) => "list",
        }
    }

    /// Interpret variable text: integer, then float, then boolean, else text.
    pub fn coerce(text: &str) -> ExprValue {
        if let Ok(i) = text.parse::<i64>() {
            return ExprValue::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            return ExprValue::Float(f);
        }
        match text {
            "True" => ExprValue::Bool(true),
            "False" => ExprValue::Bool(false),
            _ => ExprValue::Str(text.to_string()),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Int(i) => *i != 0,
            ExprValue::Float(f) => *f != 0.0,
            ExprValue::Bool(b) => *b,
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::List(items) => !items.is_empty(),
        }
    }

    /// Format for substitution back into a string. Lists have no string
    /// form; an expression embedded in a template must resolve to a scalar.
    pub fn render(&self) -> Result<String> {
        match self {
            ExprValue::Int(i) => Ok(i.to_string()),
            ExprValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 {
                    Ok(format!("{f:.1}"))
                } else {
                    Ok(format!("{f}"))
                }
            }
            ExprValue::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
            ExprValue::Str(s) => Ok(s.clone()),
            ExprValue::List(_) => Err(ResolveError::structural(
                "expressions embedded in strings must resolve to an int, \
                 float, bool, or string, not a list",
            )),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ExprValue::Int(i) => Some(*i as f64),
            ExprValue::Float(f) => Some(*f),
            ExprValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            ExprValue::Int(i) => Some(*i),
            ExprValue::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }
}

impl Expr {
    /// Evaluate against a variable source and function registry.
    pub fn eval(&self, vars: &dyn VarLookup, funcs: &FunctionRegistry) -> Result<ExprValue> {
        match self {
            Expr::Str(s) => Ok(ExprValue::Str(s.clone())),
            Expr::Int(i) => Ok(ExprValue::Int(*i)),
            Expr::Float(f) => Ok(ExprValue::Float(*f)),
            Expr::Bool(b) => Ok(ExprValue::Bool(*b)),
            Expr::Var(key) => {
                let raw = vars.lookup(key)?;
                Ok(ExprValue::coerce(&raw))
            }
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| item.eval(vars, funcs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ExprValue::List(values))
            }
            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(vars, funcs))
                    .collect::<Result<Vec<_>>>()?;
                funcs.call(name, &values)
            }
            Expr::Neg(inner) => match inner.eval(vars, funcs)? {
                ExprValue::Int(i) => i
                    .checked_neg()
                    .map(ExprValue::Int)
                    .ok_or_else(|| ResolveError::structural("integer overflow in negation")),
                ExprValue::Float(f) => Ok(ExprValue::Float(-f)),
                ExprValue::Bool(b) => Ok(ExprValue::Int(-(b as i64))),
                other => Err(ResolveError::structural(format!(
                    "cannot negate a {}",
                    other.type_name()
                ))),
            },
            Expr::Not(inner) => Ok(ExprValue::Bool(!inner.eval(vars, funcs)?.truthy())),
            Expr::Binary { op, lhs, rhs } => {
                let a = lhs.eval(vars, funcs)?;
                let b = rhs.eval(vars, funcs)?;
                arith(*op, &a, &b)
            }
            Expr::Compare { first, rest } => {
                let mut prev = first.eval(vars, funcs)?;
                for (op, rhs) in rest {
                    let next = rhs.eval(vars, funcs)?;
                    if !compare(*op, &prev, &next)? {
                        return Ok(ExprValue::Bool(false));
                    }
                    prev = next;
                }
                Ok(ExprValue::Bool(true))
            }
            Expr::And(items) => {
                for item in items {
                    if !item.eval(vars, funcs)?.truthy() {
                        return Ok(ExprValue::Bool(false));
                    }
                }
                Ok(ExprValue::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if item.eval(vars, funcs)?.truthy() {
                        return Ok(ExprValue::Bool(true));
                    }
                }
                Ok(ExprValue::Bool(false))
            }
        }
    }

    /// Collect the variable keys this expression references directly.
    pub fn collect_refs(&self, out: &mut Vec<VarKey>) {
        match self {
            Expr::Var(key) => {
                if !out.contains(key) {
                    out.push(key.clone());
                }
            }
            Expr::List(items) | Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_refs(out);
                }
            }
            Expr::Neg(inner) | Expr::Not(inner) => inner.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Compare { first, rest } => {
                first.collect_refs(out);
                for (_, rhs) in rest {
                    rhs.collect_refs(out);
                }
            }
            Expr::Str(_) | Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) => {}
        }
    }
}

fn arith(op: BinOp, a: &ExprValue, b: &ExprValue) -> Result<ExprValue> {
    // String concatenation is the one non-numeric arithmetic case.
    if op == BinOp::Add {
        if let (ExprValue::Str(x), ExprValue::Str(y)) = (a, b) {
            return Ok(ExprValue::Str(format!("{x}{y}")));
        }
    }

    let type_err = || {
        ResolveError::structural(format!(
            "cannot apply '{}' to a {} and a {}",
            op_symbol(op),
            a.type_name(),
            b.type_name()
        ))
    };

    // Integer math stays integral except for true division. Overflow is
    // an error, never a wrap.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let overflow = || {
            ResolveError::structural(format!(
                "integer overflow evaluating {x} {} {y}",
                op_symbol(op)
            ))
        };
        return match op {
            BinOp::Add => x.checked_add(y).map(ExprValue::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(ExprValue::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(ExprValue::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    Err(ResolveError::structural("division by zero"))
                } else {
                    Ok(ExprValue::Float(x as f64 / y as f64))
                }
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    Err(ResolveError::structural("division by zero"))
                } else {
                    floor_div(x, y).map(ExprValue::Int).ok_or_else(overflow)
                }
            }
            BinOp::Mod => {
                if y == 0 {
                    Err(ResolveError::structural("modulo by zero"))
                } else {
                    floor_mod(x, y).map(ExprValue::Int).ok_or_else(overflow)
                }
            }
        };
    }

    let x = a.as_f64().ok_or_else(type_err)?;
    let y = b.as_f64().ok_or_else(type_err)?;
    match op {
        BinOp::Add => Ok(ExprValue::Float(x + y)),
        BinOp::Sub => Ok(ExprValue::Float(x - y)),
        BinOp::Mul => Ok(ExprValue::Float(x * y)),
        BinOp::Div => {
            if y == 0.0 {
                Err(ResolveError::structural("division by zero"))
            } else {
                Ok(ExprValue::Float(x / y))
            }
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                Err(ResolveError::structural("division by zero"))
            } else {
                Ok(ExprValue::Float((x / y).floor()))
            }
        }
        BinOp::Mod => {
            if y == 0.0 {
                Err(ResolveError::structural("modulo by zero"))
            } else {
                Ok(ExprValue::Float(x - (x / y).floor() * y))
            }
        }
    }
}

fn compare(op: CmpOp, a: &ExprValue, b: &ExprValue) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(value_eq(a, b)),
        CmpOp::Ne => Ok(!value_eq(a, b)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                x.partial_cmp(&y)
            } else if let (ExprValue::Str(x), ExprValue::Str(y)) = (a, b) {
                Some(x.cmp(y))
            } else {
                None
            };

            let ordering = ordering.ok_or_else(|| {
                ResolveError::structural(format!(
                    "cannot order a {} against a {}",
                    a.type_name(),
                    b.type_name()
                ))
            })?;

            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn value_eq(a: &ExprValue, b: &ExprValue) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (ExprValue::Str(x), ExprValue::Str(y)) => x == y,
        (ExprValue::List(x), ExprValue::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(i, j)| value_eq(i, j))
        }
        _ => false,
    }
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_order_is_int_float_bool_text() {
        assert_eq!(ExprValue::coerce("12"), ExprValue::Int(12));
        assert_eq!(ExprValue::coerce("2.5"), ExprValue::Float(2.5));
        assert_eq!(ExprValue::coerce("True"), ExprValue::Bool(true));
        assert_eq!(
            ExprValue::coerce("true"),
            ExprValue::Str("true".to_string())
        );
    }

    #[test]
    fn floor_div_and_mod_follow_python() {
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, -2), Some(-4));
        assert_eq!(floor_mod(-7, 3), Some(2));
        assert_eq!(floor_mod(7, -3), Some(-2));
    }

    #[test]
    fn integer_overflow_is_a_structural_error() {
        let max = ExprValue::Int(i64::MAX);
        let min = ExprValue::Int(i64::MIN);

        let err = arith(BinOp::Add, &max, &ExprValue::Int(1)).unwrap_err();
        assert_eq!(err.kind().category(), "structural");
        assert!(arith(BinOp::Sub, &min, &ExprValue::Int(1)).is_err());
        assert!(arith(BinOp::Mul, &max, &ExprValue::Int(2)).is_err());
        assert!(arith(BinOp::FloorDiv, &min, &ExprValue::Int(-1)).is_err());
        assert!(arith(BinOp::Mod, &min, &ExprValue::Int(-1)).is_err());
    }

    #[test]
    fn floats_render_with_a_decimal_point() {
        assert_eq!(ExprValue::Float(2.0).render().unwrap(), "2.0");
        assert_eq!(ExprValue::Float(2.5).render().unwrap(), "2.5");
        assert_eq!(ExprValue::Int(2).render().unwrap(), "2");
        assert_eq!(ExprValue::Bool(true).render().unwrap(), "True");
    }

    #[test]
    fn lists_do_not_render() {
        assert!(ExprValue::List(vec![ExprValue::Int(1)]).render().is_err());
    }
}
