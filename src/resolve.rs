//! Final config-tree string substitution.
//!
//! Once a test's variable store is settled, every string in its config is
//! a template to render. Strings that hit a deferred variable are kept
//! verbatim behind a sentinel prefix so the node-side finalization pass
//! can finish them, except in the sections that must be concrete before
//! the test is ever scheduled.

use crate::config::ConfigValue;
use crate::errors::{Result, ResultExt};
use crate::template::{FunctionRegistry, Template};
use crate::vars::VarStore;

/// Marks a config string whose resolution is waiting on deferred variables.
pub const DEFERRED_PREFIX: &str = "!deferred!";

/// Top-level sections that must resolve fully before scheduling. A
/// deferred reference in any of these is an error, not a sentinel.
pub const NO_DEFERRED_ALLOWED: [&str; 5] =
    ["schedule", "build", "scheduler", "only_if", "not_if"];

/// Render every string in the config against the store. Deferred
/// references outside the restricted sections leave the original template
/// text behind the [`DEFERRED_PREFIX`] sentinel.
pub fn resolve_config(
    config: &ConfigValue,
    store: &VarStore,
    funcs: &FunctionRegistry,
) -> Result<ConfigValue> {
    config.map_strings(&mut |path, text| {
        let template =
            Template::parse(text).frame_with(|| format!("at config key '{}'", path.join(".")))?;
        match template.render(store, funcs) {
            Ok(rendered) => Ok(rendered),
            Err(err) if err.is_deferred() => {
                let section = path.first().map(String::as_str).unwrap_or("");
                if NO_DEFERRED_ALLOWED.contains(&section) {
                    Err(err.context(format!(
                        "the '{section}' section cannot use deferred variables \
                         (at config key '{}')",
                        path.join(".")
                    )))
                } else {
                    Ok(format!("{DEFERRED_PREFIX}{text}"))
                }
            }
            Err(err) => Err(err.frame_at(path)),
        }
    })
}

/// Render a config subtree requiring every reference to be concrete.
/// Used for the `schedule` section before the scheduler is consulted.
pub fn resolve_strict(
    value: &ConfigValue,
    store: &VarStore,
    funcs: &FunctionRegistry,
) -> Result<ConfigValue> {
    value.map_strings(&mut |path, text| {
        Template::parse(text)
            .and_then(|template| template.render(store, funcs))
            .map_err(|err| err.frame_at(path))
    })
}

/// Resolve only the sentinel-prefixed strings, against a store that is now
/// fully concrete. Everything else passes through untouched.
pub fn resolve_deferred(
    config: &ConfigValue,
    store: &VarStore,
    funcs: &FunctionRegistry,
) -> Result<ConfigValue> {
    config.map_strings(&mut |path, text| {
        let Some(raw) = text.strip_prefix(DEFERRED_PREFIX) else {
            return Ok(text.to_string());
        };
        Template::parse(raw)
            .and_then(|template| template.render(store, funcs))
            .map_err(|err| err.frame_at(path))
    })
}

trait FrameAt {
    fn frame_at(self, path: &[String]) -> Self;
}

impl FrameAt for crate::errors::ResolveError {
    fn frame_at(self, path: &[String]) -> Self {
        self.context(format!("at config key '{}'", path.join(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::build_default_function_registry;
    use crate::vars::{RawVar, Scope};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn yaml(text: &str) -> ConfigValue {
        let value: serde_yaml::Value = serde_yaml::from_str(text).unwrap();
        ConfigValue::from_yaml(&value).unwrap()
    }

    fn store() -> VarStore {
        let mut vars = BTreeMap::new();
        vars.insert("procs".to_string(), RawVar::Single("8".to_string()));
        let mut sys = BTreeMap::new();
        sys.insert("node_id".to_string(), RawVar::Deferred);

        let mut store = VarStore::new();
        store.add_scope(Scope::Var, &vars).unwrap();
        store.add_scope(Scope::Sys, &sys).unwrap();
        store
    }

    #[test]
    fn strings_render_and_deferred_values_get_sentinels() {
        let funcs = build_default_function_registry();
        let config = yaml(
            "run:\n  cmds: ['srun -n {{procs}} ./app', 'echo {{sys.node_id}}']",
        );

        let resolved = resolve_config(&config, &store(), &funcs).unwrap();
        let cmds = resolved.get("run").unwrap().get("cmds").unwrap();
        assert_eq!(
            cmds,
            &ConfigValue::List(vec![
                "srun -n 8 ./app".into(),
                format!("{DEFERRED_PREFIX}echo {{{{sys.node_id}}}}").into(),
            ])
        );
    }

    #[test]
    fn restricted_sections_reject_deferred_references() {
        let funcs = build_default_function_registry();
        for section in ["schedule", "build", "only_if", "not_if"] {
            let config = yaml(&format!("{section}:\n  value: '{{{{sys.node_id}}}}'"));
            let err = resolve_config(&config, &store(), &funcs).unwrap_err();
            assert!(err.is_deferred(), "section '{section}' should be strict");
        }
    }

    #[test]
    fn deferred_pass_finishes_the_job() {
        let funcs = build_default_function_registry();
        let config = yaml(
            "run:\n  cmds: ['echo {{sys.node_id}}']\n  plain: untouched",
        );
        let partial = resolve_config(&config, &store(), &funcs).unwrap();

        let mut sys = BTreeMap::new();
        sys.insert("node_id".to_string(), RawVar::Single("n17".to_string()));
        let mut final_store = VarStore::new();
        final_store.add_scope(Scope::Sys, &sys).unwrap();

        let finished = resolve_deferred(&partial, &final_store, &funcs).unwrap();
        let run = finished.get("run").unwrap();
        assert_eq!(run.get("cmds"), Some(&["echo n17"].into()));
        assert_eq!(run.get("plain"), Some(&"untouched".into()));
    }

    #[test]
    fn strict_resolution_fails_on_any_deferred() {
        let funcs = build_default_function_registry();
        let subtree = yaml("nodes: '{{sys.node_id}}'");
        let err = resolve_strict(&subtree, &store(), &funcs).unwrap_err();
        assert!(err.is_deferred());
    }
}
