//! Command-line config overrides.
//!
//! Overrides arrive as `dotted.key.path=value` strings. The key path is
//! walked through the config tree (mappings by key, lists by integer
//! index), the value is decoded as a YAML literal, and the result replaces
//! whatever was there. Overrides apply to a clone and commit only if every
//! one of them succeeds, so a failed batch leaves the config untouched.

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};

/// Keys that identify a test rather than configure it. Changing these from
/// the command line would corrupt test bookkeeping.
pub const NOT_OVERRIDABLE: [&str; 7] = [
    "name",
    "suite",
    "suite_path",
    "scheduler",
    "base_name",
    "host",
    "modes",
];

/// Apply a batch of overrides to a config, all-or-nothing.
pub fn apply_overrides(config: &ConfigValue, overrides: &[String]) -> Result<ConfigValue> {
    let mut updated = config.clone();
    for over in overrides {
        apply_override(&mut updated, over)
            .frame_with(|| format!("applying override '{over}'"))?;
    }
    Ok(updated)
}

fn apply_override(config: &mut ConfigValue, over: &str) -> Result<()> {
    let (key_text, value_text) = over.split_once('=').ok_or_else(|| {
        ResolveError::structural(
            "overrides must be in the form <key.path>=<value>, e.g. run.timeout=60",
        )
    })?;

    let key_text = key_text.trim();
    if key_text.is_empty() {
        return Err(ResolveError::structural("override has a blank key"));
    }

    let parts: Vec<&str> = key_text.split('.').collect();
    for part in &parts {
        if part.is_empty() {
            return Err(ResolveError::structural("override key has an empty component"));
        }
        if part.chars().any(char::is_whitespace) {
            return Err(ResolveError::structural(format!(
                "override key component '{part}' contains whitespace"
            )));
        }
    }

    if NOT_OVERRIDABLE.contains(&parts[0]) {
        return Err(ResolveError::structural(format!(
            "the '{}' key cannot be overridden",
            parts[0]
        )));
    }

    // Simple values aimed at the variables section get normalized into the
    // standard one-item variable shape.
    let is_var_value = parts[0] == "variables" && (parts.len() == 2 || parts.len() == 3);

    let mut value = decode_value(value_text)?;
    if is_var_value && matches!(value, ConfigValue::Str(_) | ConfigValue::Map(_)) {
        value = ConfigValue::List(vec![value]);
    }

    let (last, intermediate) = match parts.split_last() {
        Some(split) => split,
        None => return Err(ResolveError::structural("override has a blank key")),
    };

    let mut current = config;
    for part in intermediate {
        current = match current {
            ConfigValue::Map(map) => map.get_mut(*part).ok_or_else(|| {
                ResolveError::structural(format!(
                    "no such key '{part}' in the config; intermediate keys must exist"
                ))
            })?,
            ConfigValue::List(items) => list_slot(items, part)?,
            other => {
                return Err(ResolveError::structural(format!(
                    "cannot descend into '{part}': the value there is a {}, \
                     not a mapping or list",
                    other.type_name()
                )))
            }
        };
    }

    match current {
        // The final key of a mapping may be brand new.
        ConfigValue::Map(map) => {
            map.insert((*last).to_string(), value);
        }
        ConfigValue::List(items) => {
            *list_slot(items, last)? = value;
        }
        other => {
            return Err(ResolveError::structural(format!(
                "cannot set '{last}': the value there is a {}, \
                 not a mapping or list",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn list_slot<'a>(items: &'a mut [ConfigValue], part: &str) -> Result<&'a mut ConfigValue> {
    let idx: usize = part.parse().map_err(|e| {
        ResolveError::structural(format!(
            "list items are addressed by integer index, got '{part}'"
        ))
        .caused_by(e)
    })?;
    let len = items.len();
    items.get_mut(idx).ok_or_else(|| {
        ResolveError::structural(format!(
            "index {idx} is out of range for a list of {len} item(s)"
        ))
    })
}

/// Decode an override value as a YAML literal. Empty text is null; scalars
/// canonicalize to strings the same way loaded configs do.
fn decode_value(text: &str) -> Result<ConfigValue> {
    if text.trim().is_empty() {
        return Ok(ConfigValue::Null);
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
        ResolveError::structural(format!("invalid override value '{text}'")).caused_by(e)
    })?;
    ConfigValue::from_yaml(&yaml)
}
