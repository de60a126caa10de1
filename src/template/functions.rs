//! The expression function registry.
//!
//! Functions callable from template expressions are plain pure functions
//! over [`ExprValue`]s. The registry is a single source of truth: build it
//! once at the entrypoint (usually via [`build_default_function_registry`])
//! and pass it by reference to all resolution code.

use std::collections::HashMap;

use crate::errors::{ResolveError, Result};

use super::expr::ExprValue;

pub type ExprFunction = fn(&[ExprValue]) -> Result<ExprValue>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    funcs: HashMap<String, ExprFunction>,
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry {
            funcs: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, func: ExprFunction) {
        self.funcs.insert(name.to_string(), func);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[ExprValue]) -> Result<ExprValue> {
        let func = self.funcs.get(name).ok_or_else(|| {
            ResolveError::structural(format!("no such expression function '{name}'"))
        })?;
        func(args).map_err(|e| e.context(format!("in call to '{name}'")))
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

/// Builds a registry populated with the standard function set.
pub fn build_default_function_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("int", fn_int);
    registry.register("floor", fn_floor);
    registry.register("ceil", fn_ceil);
    registry.register("round", fn_round);
    registry.register("min", fn_min);
    registry.register("max", fn_max);
    registry.register("len", fn_len);
    registry.register("sum", fn_sum);
    registry.register("random", fn_random);
    registry
}

fn expect_arity(args: &[ExprValue], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ResolveError::structural(format!(
            "expected {} argument(s), got {}",
            expected,
            args.len()
        )))
    }
}

fn numeric(value: &ExprValue) -> Result<f64> {
    match value {
        ExprValue::Int(i) => Ok(*i as f64),
        ExprValue::Float(f) => Ok(*f),
        ExprValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(ResolveError::structural(format!(
            "expected a number, got a {}",
            other.type_name()
        ))),
    }
}

fn fn_int(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    match &args[0] {
        ExprValue::Int(i) => Ok(ExprValue::Int(*i)),
        ExprValue::Float(f) => Ok(ExprValue::Int(f.trunc() as i64)),
        ExprValue::Bool(b) => Ok(ExprValue::Int(*b as i64)),
        ExprValue::Str(s) => s.trim().parse::<i64>().map(ExprValue::Int).map_err(|e| {
            ResolveError::structural(format!("'{s}' is not an integer")).caused_by(e)
        }),
        ExprValue::List(_) => Err(ResolveError::structural("cannot convert a list to int")),
    }
}

fn fn_floor(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    Ok(ExprValue::Int(numeric(&args[0])?.floor() as i64))
}

fn fn_ceil(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    Ok(ExprValue::Int(numeric(&args[0])?.ceil() as i64))
}

fn fn_round(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    Ok(ExprValue::Int(numeric(&args[0])?.round() as i64))
}

/// min/max accept either a single list or two-plus direct arguments.
fn spread(args: &[ExprValue]) -> Result<Vec<ExprValue>> {
    match args {
        [ExprValue::List(items)] => Ok(items.clone()),
        _ if args.len() >= 2 => Ok(args.to_vec()),
        _ => Err(ResolveError::structural(
            "expected a list or at least two arguments",
        )),
    }
}

fn extremum(args: &[ExprValue], want_max: bool) -> Result<ExprValue> {
    let items = spread(args)?;
    let mut best: Option<(f64, ExprValue)> = None;
    for item in items {
        let n = numeric(&item)?;
        let better = match &best {
            Some((current, _)) => {
                if want_max {
                    n > *current
                } else {
                    n < *current
                }
            }
            None => true,
        };
        if better {
            best = Some((n, item));
        }
    }
    best.map(|(_, v)| v)
        .ok_or_else(|| ResolveError::structural("cannot take the extremum of an empty list"))
}

fn fn_min(args: &[ExprValue]) -> Result<ExprValue> {
    extremum(args, false)
}

fn fn_max(args: &[ExprValue]) -> Result<ExprValue> {
    extremum(args, true)
}

fn fn_len(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    match &args[0] {
        ExprValue::List(items) => Ok(ExprValue::Int(items.len() as i64)),
        ExprValue::Str(s) => Ok(ExprValue::Int(s.chars().count() as i64)),
        other => Err(ResolveError::structural(format!(
            "cannot take the length of a {}",
            other.type_name()
        ))),
    }
}

fn fn_sum(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 1)?;
    let items = match &args[0] {
        ExprValue::List(items) => items,
        other => {
            return Err(ResolveError::structural(format!(
                "sum expects a list, got a {}",
                other.type_name()
            )))
        }
    };

    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut saw_float = false;
    for item in items {
        match item {
            ExprValue::Int(i) => int_total += i,
            ExprValue::Bool(b) => int_total += *b as i64,
            ExprValue::Float(f) => {
                saw_float = true;
                float_total += f;
            }
            other => {
                return Err(ResolveError::structural(format!(
                    "sum expects numbers, got a {}",
                    other.type_name()
                )))
            }
        }
    }

    if saw_float {
        Ok(ExprValue::Float(float_total + int_total as f64))
    } else {
        Ok(ExprValue::Int(int_total))
    }
}

fn fn_random(args: &[ExprValue]) -> Result<ExprValue> {
    expect_arity(args, 0)?;
    Ok(ExprValue::Float(rand::random::<f64>()))
}
