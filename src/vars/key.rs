//! Variable key parsing.
//!
//! Variables are addressed with dotted keys of up to four components:
//! `scope.name.index.subkey`. Everything but the name is optional; a missing
//! scope is resolved by a fixed priority search over the store's scopes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ResolveError, Result};

/// The reserved variable namespaces. Declaration order is the priority
/// search order for unscoped lookups.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Test-defined variables (the config's `variables` section).
    Var,
    /// System-provided values, possibly deferred until run time.
    Sys,
    /// Values provided by pavise itself.
    Pav,
    /// Scheduler-provided values, installed late in permutation.
    Sched,
    /// Per-permutation values.
    Per,
}

impl Scope {
    pub const SEARCH_ORDER: [Scope; 5] =
        [Scope::Var, Scope::Sys, Scope::Pav, Scope::Sched, Scope::Per];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Var => "var",
            Scope::Sys => "sys",
            Scope::Pav => "pav",
            Scope::Sched => "sched",
            Scope::Per => "per",
        }
    }

    pub fn from_name(name: &str) -> Option<Scope> {
        match name {
            "var" => Some(Scope::Var),
            "sys" => Some(Scope::Sys),
            "pav" => Some(Scope::Pav),
            "sched" => Some(Scope::Sched),
            "per" => Some(Scope::Per),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed variable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarKey {
    pub scope: Option<Scope>,
    pub name: String,
    pub index: Option<usize>,
    pub subkey: Option<String>,
}

impl VarKey {
    /// A bare, unscoped name with no index or subkey.
    pub fn named(name: impl Into<String>) -> VarKey {
        VarKey {
            scope: None,
            name: name.into(),
            index: None,
            subkey: None,
        }
    }

    /// Parse dotted key text. The leading component is taken as a scope only
    /// when it names one of the reserved scopes; a numeric component after
    /// the name is an index; one trailing component is a subkey. Anything
    /// further is an error.
    pub fn parse(text: &str) -> Result<VarKey> {
        let parts: Vec<&str> = text.split('.').collect();
        let mut rest = parts.as_slice();

        let scope = match Scope::from_name(rest[0]) {
            Some(scope) => {
                rest = &rest[1..];
                Some(scope)
            }
            None => None,
        };

        let name = match rest.first() {
            Some(part) if is_ident(part) => {
                rest = &rest[1..];
                (*part).to_string()
            }
            Some(part) => {
                return Err(ResolveError::reference(
                    text,
                    format!("invalid variable name '{part}'"),
                ))
            }
            None => {
                return Err(ResolveError::reference(text, "missing variable name"));
            }
        };

        let index = match rest.first() {
            Some(part) if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) => {
                let idx = part.parse::<usize>().map_err(|e| {
                    ResolveError::reference(text, format!("invalid index '{part}'"))
                        .caused_by(e)
                })?;
                rest = &rest[1..];
                Some(idx)
            }
            _ => None,
        };

        let subkey = match rest.first() {
            Some(part) if is_ident(part) => {
                rest = &rest[1..];
                Some((*part).to_string())
            }
            Some(part) => {
                return Err(ResolveError::reference(
                    text,
                    format!("invalid sub-key '{part}'"),
                ))
            }
            None => None,
        };

        if !rest.is_empty() {
            return Err(ResolveError::reference(
                text,
                "too many dotted components; keys are at most 'scope.name.index.subkey'",
            ));
        }

        Ok(VarKey {
            scope,
            name,
            index,
            subkey,
        })
    }
}

impl FromStr for VarKey {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<VarKey> {
        VarKey::parse(s)
    }
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = self.scope {
            write!(f, "{scope}.")?;
        }
        f.write_str(&self.name)?;
        if let Some(index) = self.index {
            write!(f, ".{index}")?;
        }
        if let Some(subkey) = &self.subkey {
            write!(f, ".{subkey}")?;
        }
        Ok(())
    }
}

fn is_ident(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_key_shapes() {
        assert_eq!(VarKey::parse("foo").unwrap(), VarKey::named("foo"));

        let key = VarKey::parse("sys.host_name").unwrap();
        assert_eq!(key.scope, Some(Scope::Sys));
        assert_eq!(key.name, "host_name");

        let key = VarKey::parse("var.foo.3.bar").unwrap();
        assert_eq!(
            key,
            VarKey {
                scope: Some(Scope::Var),
                name: "foo".to_string(),
                index: Some(3),
                subkey: Some("bar".to_string()),
            }
        );

        // Without a scope, a numeric second part is an index.
        let key = VarKey::parse("foo.0").unwrap();
        assert_eq!(key.index, Some(0));
        assert_eq!(key.subkey, None);

        // A non-numeric second part is a subkey.
        let key = VarKey::parse("foo.bar").unwrap();
        assert_eq!(key.index, None);
        assert_eq!(key.subkey.as_deref(), Some("bar"));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(VarKey::parse("").is_err());
        assert!(VarKey::parse("sys.").is_err());
        assert!(VarKey::parse("a.b.c.d.e").is_err());
        assert!(VarKey::parse("var.foo.1.bar.baz").is_err());
        assert!(VarKey::parse("9lives").is_err());
    }

    #[test]
    fn display_round_trips() {
        for text in ["foo", "sys.foo", "foo.2.bar", "var.foo.0.sub"] {
            assert_eq!(VarKey::parse(text).unwrap().to_string(), text);
        }
    }
}
