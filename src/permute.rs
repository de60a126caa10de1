//! Permutation resolution.
//!
//! A test config names variables in `permute_on`; the test runs once per
//! combination of their values. Expansion is progressive: variables whose
//! values are already concrete permute first, then the values that only
//! resolve among themselves once pinned, and finally whatever had to wait
//! for scheduler variables. Every phase works on whole variable stores,
//! so each permutation ends up with its own store pinned to one value per
//! permuted variable.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};
use crate::resolve::resolve_strict;
use crate::sched::SchedulerRegistry;
use crate::template::FunctionRegistry;
use crate::vars::{sort_pairs, Scope, VarKey, VarStore, Variable};

/// The scheduler used when a config names none.
pub const DEFAULT_SCHEDULER: &str = "raw";

/// One config's permutation output: the updated config (carrying its
/// permutation-group id and generated subtitle) and one store per
/// permutation.
#[derive(Debug, Clone)]
pub struct PermutedConfig {
    pub config: ConfigValue,
    pub stores: Vec<VarStore>,
}

/// Expand a test config into its permutations.
///
/// The incoming store must already hold the `var` scope (from the config's
/// `variables` section) along with the base `sys`/`pav` scopes. The
/// scheduler scope is installed here, per permutation branch, after the
/// `schedule` section resolves.
pub fn resolve_permutations(
    config: &ConfigValue,
    store: &VarStore,
    schedulers: &SchedulerRegistry,
    funcs: &FunctionRegistry,
) -> Result<PermutedConfig> {
    let permute_names = permute_on(config)?;
    let pairs = check_permute_vars(store, &permute_names)?;

    let mut config = config.clone();
    config.set("permute_base", ConfigValue::from(permute_base()))?;
    if !pairs.is_empty() && config.get("subtitle").and_then(ConfigValue::as_str).is_none() {
        config.set("subtitle", ConfigValue::from(subtitle_template(store, &pairs)))?;
    }

    // The scheduler plugin must exist and be usable before any expansion
    // work happens on its behalf.
    let sched_name = config
        .get("scheduler")
        .and_then(ConfigValue::as_str)
        .unwrap_or(DEFAULT_SCHEDULER)
        .to_string();
    schedulers.get(&sched_name)?;

    let mut pending: BTreeSet<(Scope, String)> = pairs.into_iter().collect();
    let mut stores = vec![store.clone()];

    // Progressive phase: permute whatever is already concrete, resolve,
    // repeat. Resolution skips the pending names so their templated values
    // stay untouched until their turn comes.
    let mut last_could_resolve: HashSet<String>;
    loop {
        let skip: HashSet<String> = pending
            .iter()
            .filter(|(scope, _)| *scope == Scope::Var)
            .map(|(_, name)| name.clone())
            .collect();

        let mut resolved_all: Option<HashSet<String>> = None;
        let mut could_all: Option<HashSet<String>> = None;
        for store in &mut stores {
            let (resolved, could) = store.resolve_references(funcs, true, &skip)?;
            resolved_all = Some(match resolved_all {
                Some(acc) => acc.intersection(&resolved).cloned().collect(),
                None => resolved,
            });
            could_all = Some(match could_all {
                Some(acc) => acc.intersection(&could).cloned().collect(),
                None => could,
            });
        }
        let resolved = resolved_all.unwrap_or_default();
        last_could_resolve = could_all.unwrap_or_default();

        let permute_now: Vec<(Scope, String)> = pending
            .iter()
            .filter(|(scope, name)| match scope {
                Scope::Sched => false,
                Scope::Var => resolved.contains(name),
                _ => true,
            })
            .cloned()
            .collect();

        if permute_now.is_empty() {
            break;
        }
        debug!(count = permute_now.len(), "permuting concrete variables");

        let mut next = Vec::new();
        for store in &stores {
            next.extend(store.get_permutations(&permute_now)?);
        }
        stores = next;
        for pair in &permute_now {
            pending.remove(pair);
        }
    }

    // Self-reference phase: variables that only failed to resolve because
    // they were being permuted can permute now; pinning them breaks the
    // self-dependency.
    let self_ref: Vec<(Scope, String)> = pending
        .iter()
        .filter(|(scope, name)| *scope == Scope::Var && last_could_resolve.contains(name))
        .cloned()
        .collect();
    if !self_ref.is_empty() {
        debug!(count = self_ref.len(), "permuting self-referential variables");
        let mut next = Vec::new();
        for store in &stores {
            next.extend(store.get_permutations(&self_ref)?);
        }
        stores = next;
        for pair in &self_ref {
            pending.remove(pair);
        }
    }

    // Scheduler phase: each branch resolves its schedule section, gets the
    // scheduler's variables, and finishes resolution with a complete
    // store. Only then can sched-scoped permutations expand.
    let schedule = config
        .get("schedule")
        .cloned()
        .unwrap_or_else(ConfigValue::map);
    let remaining: Vec<(Scope, String)> = pending.into_iter().collect();

    let mut final_stores = Vec::new();
    for mut store in stores {
        // Values that waited on a variable pinned in the self-reference
        // phase are still raw template text; settle everything that can
        // resolve before the scheduler sees the schedule section.
        store.resolve_references(funcs, true, &HashSet::new())?;
        let schedule = resolve_strict(&schedule, &store, funcs)
            .frame("resolving the 'schedule' section")?;
        let sched_vars = schedulers.initial_vars(&sched_name, &schedule)?;
        store.add_scope(Scope::Sched, &sched_vars)?;
        store.resolve_references(funcs, false, &HashSet::new())?;
        final_stores.extend(store.get_permutations(&remaining)?);
    }

    debug!(permutations = final_stores.len(), scheduler = %sched_name, "permutation complete");
    Ok(PermutedConfig {
        config,
        stores: final_stores,
    })
}

fn permute_on(config: &ConfigValue) -> Result<Vec<String>> {
    match config.get("permute_on") {
        None | Some(ConfigValue::Null) => Ok(Vec::new()),
        Some(ConfigValue::List(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ResolveError::structural(format!(
                        "'permute_on' entries must be variable names, got a {}",
                        item.type_name()
                    ))
                })
            })
            .collect(),
        Some(ConfigValue::Str(name)) => Ok(vec![name.clone()]),
        Some(other) => Err(ResolveError::structural(format!(
            "'permute_on' must be a list of variable names, got a {}",
            other.type_name()
        ))),
    }
}

/// Validate the permutation variable names against the store.
///
/// Names must be plain (no index, no sub-key) and must not be deferred.
/// Unknown names are tolerated only when explicitly `sched`-scoped, since
/// the scheduler scope doesn't exist yet.
fn check_permute_vars(store: &VarStore, names: &[String]) -> Result<Vec<(Scope, String)>> {
    let mut pairs = Vec::new();

    for name in names {
        let key = VarKey::parse(name).frame("in 'permute_on'")?;
        if key.index.is_some() || key.subkey.is_some() {
            return Err(ResolveError::structural(format!(
                "cannot permute on '{name}': permutation variables are named \
                 without indexes or sub-keys"
            )));
        }

        match store.resolve_key(&key) {
            Ok((scope, _)) => {
                if store.any_deferred(&key)? {
                    return Err(ResolveError::deferred(key.to_string())
                        .context("deferred variables cannot be permuted on"));
                }
                pairs.push((scope, key.name));
            }
            Err(err) => {
                if key.scope == Some(Scope::Sched) {
                    pairs.push((Scope::Sched, key.name));
                } else {
                    return Err(err.context("in 'permute_on'"));
                }
            }
        }
    }

    Ok(sort_pairs(&pairs))
}

/// A unique id shared by every permutation of one resolved config.
fn permute_base() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Build the subtitle template naming each permutation.
///
/// One token per permuted variable, in sorted pair order, joined with `-`:
/// scheduler variables keep their raw template token (they resolve late),
/// map-shaped variables get a literal underscore marker (no single value
/// to show), and everything else gets a template token that renders to the
/// pinned value.
fn subtitle_template(store: &VarStore, pairs: &[(Scope, String)]) -> String {
    let tokens: Vec<String> = pairs
        .iter()
        .map(|(scope, name)| match scope {
            Scope::Sched => format!("{{{{sched.{name}}}}}"),
            _ => {
                let map_shaped = matches!(
                    store.variable(*scope, name),
                    Some(Variable::Items(items)) if items.first().is_some_and(|i| i.is_map())
                );
                if map_shaped {
                    format!("_{name}_")
                } else {
                    format!("{{{{{name}}}}}")
                }
            }
        })
        .collect();
    tokens.join("-")
}
