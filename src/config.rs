//! The raw config tree.
//!
//! Configs arrive from an external loader as YAML-like trees of scalars,
//! sequences and mappings. Internally everything is an explicit tagged
//! [`ConfigValue`] so the resolution phases can visit and transform the tree
//! generically. All scalar leaves are strings; the template language decides
//! what they mean.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ResolveError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Str(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Str(_) => "string",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "mapping",
        }
    }

    pub fn map() -> ConfigValue {
        ConfigValue::Map(BTreeMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Set a key on a map value. Structural error on non-maps.
    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) -> Result<()> {
        match self {
            ConfigValue::Map(map) => {
                map.insert(key.into(), value);
                Ok(())
            }
            other => Err(ResolveError::structural(format!(
                "cannot set key on a {} value",
                other.type_name()
            ))),
        }
    }

    /// Convert a YAML value into a config tree, canonicalizing scalars to
    /// strings the way the config language expects: booleans become
    /// `True`/`False`, numbers keep their literal form.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<ConfigValue> {
        Ok(match value {
            serde_yaml::Value::Null => ConfigValue::Null,
            serde_yaml::Value::Bool(b) => {
                ConfigValue::Str(if *b { "True" } else { "False" }.to_string())
            }
            serde_yaml::Value::Number(n) => ConfigValue::Str(n.to_string()),
            serde_yaml::Value::String(s) => ConfigValue::Str(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                let items = seq
                    .iter()
                    .map(ConfigValue::from_yaml)
                    .collect::<Result<Vec<_>>>()?;
                ConfigValue::List(items)
            }
            serde_yaml::Value::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let key = match k {
                        serde_yaml::Value::String(s) => s.clone(),
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(ResolveError::structural(format!(
                                "mapping keys must be scalars, got a {:?}",
                                other
                            )))
                        }
                    };
                    out.insert(key, ConfigValue::from_yaml(v)?);
                }
                ConfigValue::Map(out)
            }
            serde_yaml::Value::Tagged(tagged) => ConfigValue::from_yaml(&tagged.value)?,
        })
    }

    /// Rebuild the tree, transforming every string leaf. The callback gets
    /// the dotted key path to the leaf, for error context and for sections
    /// with special rules.
    pub fn map_strings<F>(&self, transform: &mut F) -> Result<ConfigValue>
    where
        F: FnMut(&[String], &str) -> Result<String>,
    {
        let mut path = Vec::new();
        self.map_strings_inner(&mut path, transform)
    }

    fn map_strings_inner<F>(&self, path: &mut Vec<String>, transform: &mut F) -> Result<ConfigValue>
    where
        F: FnMut(&[String], &str) -> Result<String>,
    {
        Ok(match self {
            ConfigValue::Null => ConfigValue::Null,
            ConfigValue::Str(s) => ConfigValue::Str(transform(path, s)?),
            ConfigValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(i.to_string());
                    out.push(item.map_strings_inner(path, transform)?);
                    path.pop();
                }
                ConfigValue::List(out)
            }
            ConfigValue::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    path.push(key.clone());
                    out.insert(key.clone(), value.map_strings_inner(path, transform)?);
                    path.pop();
                }
                ConfigValue::Map(out)
            }
        })
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl<const N: usize> From<[&str; N]> for ConfigValue {
    fn from(items: [&str; N]) -> Self {
        ConfigValue::List(items.iter().map(|s| ConfigValue::from(*s)).collect())
    }
}
