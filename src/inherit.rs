//! Suite inheritance resolution.
//!
//! Every test in a suite inherits from exactly one parent. Tests that name
//! no parent inherit from the implicit base config. Resolution walks the
//! parent graph breadth-first from the base; anything left over when the
//! queue drains is either a loop or names a parent that doesn't exist.
//!
//! Merge rules: mappings merge recursively, lists replace wholesale, and a
//! null child value keeps the parent's. The `build`/`run` command lists
//! additionally honor `prepend_cmds`/`append_cmds` markers, which are
//! materialized into `cmds` and cleared at merge time.

use std::collections::{BTreeMap, HashSet, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};

/// The implicit root of every suite's inheritance graph.
pub const BASE_TEST: &str = "__base__";

/// The config key naming a test's parent.
pub const INHERITS_FROM: &str = "inherits_from";

/// Sections whose command lists support prepend/append markers.
const CMD_SECTIONS: [&str; 2] = ["build", "run"];

/// Resolve a whole suite's inheritance down to flat per-test configs.
///
/// Each output config carries its own `name` and the `suite` name; the
/// implicit base never appears in the output.
pub fn resolve_inheritance(
    suite_name: &str,
    suite: &BTreeMap<String, ConfigValue>,
    base: &ConfigValue,
) -> Result<BTreeMap<String, ConfigValue>> {
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, config) in suite {
        if config.as_map().is_none() {
            return Err(ResolveError::structural(format!(
                "test '{name}' must be a mapping, got a {}",
                config.type_name()
            ))
            .context(format!("in suite '{suite_name}'")));
        }
        let parent = match config.get(INHERITS_FROM) {
            None | Some(ConfigValue::Null) => BASE_TEST,
            Some(ConfigValue::Str(parent)) => parent,
            Some(other) => {
                return Err(ResolveError::structural(format!(
                    "test '{name}': '{INHERITS_FROM}' must be a test name, got a {}",
                    other.type_name()
                ))
                .context(format!("in suite '{suite_name}'")))
            }
        };
        children
            .entry(parent.to_string())
            .or_default()
            .push(name.clone());
    }

    let mut resolved: BTreeMap<String, ConfigValue> = BTreeMap::new();
    resolved.insert(BASE_TEST.to_string(), base.clone());

    let mut ready: VecDeque<String> = VecDeque::new();
    ready.push_back(BASE_TEST.to_string());

    while let Some(parent) = ready.pop_front() {
        let Some(test_names) = children.remove(&parent) else {
            continue;
        };
        let Some(parent_config) = resolved.get(&parent).cloned() else {
            continue;
        };

        for name in test_names {
            let Some(child_config) = suite.get(&name) else {
                continue;
            };
            let mut merged = merge_values(&parent_config, child_config);
            materialize_cmds(&mut merged);
            debug!(test = %name, parent = %parent, "resolved inheritance");
            resolved.insert(name.clone(), merged);
            ready.push_back(name);
        }
    }

    if !children.is_empty() {
        let mut chain: Vec<String> = children
            .values()
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        chain.sort();
        return Err(ResolveError::cycle(chain).context(format!(
            "inheritance in suite '{suite_name}' is cyclic or names undefined parents"
        )));
    }

    resolved.remove(BASE_TEST);
    for (name, config) in &mut resolved {
        config.set("name", ConfigValue::from(name.clone()))?;
        config.set("suite", ConfigValue::from(suite_name))?;
    }
    Ok(resolved)
}

/// Merge a child config over its parent.
fn merge_values(parent: &ConfigValue, child: &ConfigValue) -> ConfigValue {
    match (parent, child) {
        // A null child defers to the parent entirely.
        (_, ConfigValue::Null) => parent.clone(),
        (ConfigValue::Map(parent_map), ConfigValue::Map(child_map)) => {
            let mut out = parent_map.clone();
            for (key, child_value) in child_map {
                let merged = match parent_map.get(key) {
                    Some(parent_value) => merge_values(parent_value, child_value),
                    None => child_value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            ConfigValue::Map(out)
        }
        // Lists (and any scalar) replace wholesale.
        (_, other) => other.clone(),
    }
}

/// Fold `prepend_cmds`/`append_cmds` into `cmds` for the build and run
/// sections, clearing the markers so they never apply twice.
fn materialize_cmds(config: &mut ConfigValue) {
    let Some(map) = config.as_map_mut() else {
        return;
    };

    for section_name in CMD_SECTIONS {
        let Some(section) = map.get_mut(section_name).and_then(ConfigValue::as_map_mut)
        else {
            continue;
        };

        let prepend = take_list(section, "prepend_cmds");
        let append = take_list(section, "append_cmds");
        if prepend.is_empty() && append.is_empty() {
            continue;
        }

        let existing = match section.remove("cmds") {
            Some(ConfigValue::List(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };

        let mut cmds = prepend;
        cmds.extend(existing);
        cmds.extend(append);
        section.insert("cmds".to_string(), ConfigValue::List(cmds));
        section.insert("prepend_cmds".to_string(), ConfigValue::List(Vec::new()));
        section.insert("append_cmds".to_string(), ConfigValue::List(Vec::new()));
    }
}

fn take_list(section: &mut BTreeMap<String, ConfigValue>, key: &str) -> Vec<ConfigValue> {
    match section.remove(key) {
        Some(ConfigValue::List(items)) => items,
        Some(ConfigValue::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

// ============================================================================
// VERSION COMPATIBILITY
// ============================================================================

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+){0,2}$").expect("static version pattern is valid"));

/// Check a resolved config's `compatible_versions` declaration against the
/// running version. Ranges look like `1`, `1.2`, `1.2.3`, or `lo-hi`; bound
/// comparisons only consider as many components as the bound itself names.
pub fn check_version_compatibility(config: &ConfigValue, current: &str) -> Result<()> {
    let required = match config.get("compatible_versions") {
        Some(ConfigValue::Str(text)) if !text.trim().is_empty() => text.trim(),
        _ => return Ok(()),
    };

    let (low_text, high_text) = match required.split_once('-') {
        Some((low, high)) => (low.trim(), high.trim()),
        None => (required, required),
    };

    let low = parse_version(low_text).frame_with(|| {
        format!("in 'compatible_versions' range '{required}'")
    })?;
    let high = parse_version(high_text).frame_with(|| {
        format!("in 'compatible_versions' range '{required}'")
    })?;
    let current_parts = parse_version(current)
        .frame("parsing the running version")?;

    let trimmed = |len: usize| &current_parts[..len.min(current_parts.len())];
    if trimmed(low.len()) < low.as_slice() || trimmed(high.len()) > high.as_slice() {
        return Err(ResolveError::version(required, current));
    }
    Ok(())
}

fn parse_version(text: &str) -> Result<Vec<u64>> {
    if !VERSION_RE.is_match(text) {
        return Err(ResolveError::structural(format!(
            "invalid version '{text}'; versions look like '1', '1.2', or '1.2.3'"
        )));
    }
    text.split('.')
        .map(|part| {
            part.parse::<u64>().map_err(|e| {
                ResolveError::structural(format!("invalid version component '{part}'"))
                    .caused_by(e)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> ConfigValue {
        let value: serde_yaml::Value = serde_yaml::from_str(text).unwrap();
        ConfigValue::from_yaml(&value).unwrap()
    }

    fn suite(text: &str) -> BTreeMap<String, ConfigValue> {
        yaml(text).as_map().unwrap().clone()
    }

    #[test]
    fn base_and_chained_inheritance() {
        let base = yaml("scheduler: raw\nrun:\n  timeout: '300'");
        let tests = suite(
            "first:\n  run:\n    cmds: ['echo first']\n\
             second:\n  inherits_from: first\n  run:\n    timeout: '60'",
        );

        let resolved = resolve_inheritance("demo", &tests, &base).unwrap();

        let second = &resolved["second"];
        assert_eq!(second.get("scheduler"), Some(&"raw".into()));
        assert_eq!(second.get("name"), Some(&"second".into()));
        assert_eq!(second.get("suite"), Some(&"demo".into()));
        let run = second.get("run").unwrap();
        assert_eq!(run.get("timeout"), Some(&"60".into()));
        assert_eq!(run.get("cmds"), Some(&["echo first"].into()));
    }

    #[test]
    fn inheritance_loops_are_cycle_errors() {
        let tests = suite(
            "a:\n  inherits_from: b\nb:\n  inherits_from: a\nok:\n  run:\n    cmds: ['echo']",
        );
        let err = resolve_inheritance("demo", &tests, &ConfigValue::map()).unwrap_err();

        match err.kind() {
            ErrorKind::Cycle { chain } => {
                assert_eq!(chain, &vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn undefined_parents_are_reported_like_cycles() {
        let tests = suite("orphan:\n  inherits_from: nonexistent");
        let err = resolve_inheritance("demo", &tests, &ConfigValue::map()).unwrap_err();
        assert_eq!(err.kind().category(), "cycle");
    }

    #[test]
    fn lists_replace_and_null_defers() {
        let base = yaml("run:\n  cmds: ['a', 'b']\nbuild:\n  source: tarball");
        let tests = suite("t:\n  run:\n    cmds: ['c']\n  build:");

        let resolved = resolve_inheritance("demo", &tests, &base).unwrap();
        let t = &resolved["t"];
        assert_eq!(t.get("run").unwrap().get("cmds"), Some(&["c"].into()));
        // The null build section kept the parent's.
        assert_eq!(
            t.get("build").unwrap().get("source"),
            Some(&"tarball".into())
        );
    }

    #[test]
    fn cmd_markers_fold_into_cmds() {
        let base = yaml("run:\n  cmds: ['middle']");
        let tests = suite(
            "t:\n  run:\n    prepend_cmds: ['first']\n    append_cmds: ['last']",
        );

        let resolved = resolve_inheritance("demo", &tests, &base).unwrap();
        let run = resolved["t"].get("run").unwrap();
        assert_eq!(run.get("cmds"), Some(&["first", "middle", "last"].into()));
        assert_eq!(run.get("prepend_cmds"), Some(&ConfigValue::List(Vec::new())));
        assert_eq!(run.get("append_cmds"), Some(&ConfigValue::List(Vec::new())));
    }

    #[test]
    fn version_ranges_check_only_named_components() {
        let ok = yaml("compatible_versions: '2.1-3'");
        assert!(check_version_compatibility(&ok, "2.5.1").is_ok());
        assert!(check_version_compatibility(&ok, "3.9.9").is_ok());
        assert!(check_version_compatibility(&ok, "2.0.9").is_err());
        assert!(check_version_compatibility(&ok, "4.0").is_err());

        let exact = yaml("compatible_versions: '2.1'");
        assert!(check_version_compatibility(&exact, "2.1.7").is_ok());
        assert!(check_version_compatibility(&exact, "2.2.0").is_err());

        let absent = yaml("run: {}");
        assert!(check_version_compatibility(&absent, "1.0").is_ok());
    }

    #[test]
    fn malformed_versions_are_structural() {
        let bad = yaml("compatible_versions: 'not-a-version'");
        let err = check_version_compatibility(&bad, "1.0").unwrap_err();
        assert_eq!(err.kind().category(), "structural");
    }
}
