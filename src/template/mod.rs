//! The template/expression language.
//!
//! Config value strings are templates: literal text with embedded
//! `{{ expression }}` spans. Expressions reference variables with dotted
//! keys, do arithmetic and chained comparisons, and call into the
//! expression function registry.

pub mod expr;
pub mod functions;
pub mod parser;

pub use expr::{Expr, ExprValue};
pub use functions::{build_default_function_registry, ExprFunction, FunctionRegistry};
pub use parser::Template;

use crate::errors::Result;
use crate::vars::key::VarKey;

/// The seam between expression evaluation and variable storage. A lookup
/// returns the concrete text for a fully addressed key; reads of deferred
/// values fail with a deferred-access error the caller may treat as
/// non-fatal.
pub trait VarLookup {
    fn lookup(&self, key: &VarKey) -> Result<String>;
}
