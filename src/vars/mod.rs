//! The variable store.
//!
//! Variables live in namespaced scopes ([`Scope`]) and hold one or more
//! items, each mapping sub-keys to values. Values are either concrete text
//! or deferred: intentionally unknowable until later (typically until the
//! test lands on its allocation). The store provides priority lookup,
//! deferred tracking, iterative reference resolution with cycle detection,
//! Cartesian permutation expansion, and lossless JSON save/load.
//!
//! Stores are cloned aggressively during permutation; the persistent maps
//! make those clones cheap.

pub mod key;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use im::OrdMap;
use serde::{Deserialize, Serialize};

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};
use crate::template::{FunctionRegistry, Template, VarLookup};

pub use key::{Scope, VarKey};

/// The reserved sub-key under which a simple (non-mapping) value is stored.
pub const SIMPLE_SUBKEY: &str = "";

// ============================================================================
// VALUES
// ============================================================================

/// A single stored value. Deferred values recorded during reference
/// resolution keep the unresolved template text so a later pass (with a
/// complete store) can finish the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Concrete(String),
    Deferred {
        #[serde(rename = "__deferred")]
        raw: Option<String>,
    },
}

impl VarValue {
    pub fn deferred() -> VarValue {
        VarValue::Deferred { raw: None }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, VarValue::Deferred { .. })
    }
}

/// One element of a variable's item sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarItem(BTreeMap<String, VarValue>);

impl VarItem {
    pub fn simple(value: impl Into<String>) -> VarItem {
        let mut map = BTreeMap::new();
        map.insert(SIMPLE_SUBKEY.to_string(), VarValue::Concrete(value.into()));
        VarItem(map)
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> VarItem {
        VarItem(
            map.iter()
                .map(|(k, v)| (k.clone(), VarValue::Concrete(v.clone())))
                .collect(),
        )
    }

    pub fn get(&self, subkey: Option<&str>) -> Option<&VarValue> {
        self.0.get(subkey.unwrap_or(SIMPLE_SUBKEY))
    }

    /// Sub-key names, sorted. The simple slot shows up as the empty string.
    pub fn subkeys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Whether this item carries named sub-keys (a "complex" value).
    pub fn is_map(&self) -> bool {
        self.0.keys().any(|k| k != SIMPLE_SUBKEY)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn set(&mut self, subkey: &str, value: VarValue) {
        self.0.insert(subkey.to_string(), value);
    }
}

/// A whole variable: either wholly deferred (e.g. a node-side system value)
/// or a sequence of items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Items(Vec<VarItem>),
    Deferred,
}

impl Variable {
    /// Build from raw config data, validating sub-key consistency.
    fn from_raw(scope: Scope, name: &str, raw: &RawVar) -> Result<Variable> {
        let items = match raw {
            RawVar::Deferred => return Ok(Variable::Deferred),
            RawVar::Single(value) => vec![VarItem::simple(value.clone())],
            RawVar::Map(map) => vec![VarItem::from_map(map)],
            RawVar::List(raw_items) => raw_items
                .iter()
                .map(|item| match item {
                    RawItem::Single(value) => VarItem::simple(value.clone()),
                    RawItem::Map(map) => VarItem::from_map(map),
                })
                .collect(),
        };

        if items.is_empty() {
            return Err(ResolveError::structural(format!(
                "variable '{scope}.{name}' has no values"
            )));
        }

        let first_keys = items[0].subkeys();
        for item in &items[1..] {
            if item.subkeys() != first_keys {
                return Err(ResolveError::structural(format!(
                    "variable '{scope}.{name}' has inconsistent sub-keys across its \
                     values: {:?} vs {:?}",
                    first_keys,
                    item.subkeys()
                )));
            }
        }

        Ok(Variable::Items(items))
    }
}

// ============================================================================
// RAW INPUT
// ============================================================================

/// One element of a raw variable value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawItem {
    Single(String),
    Map(BTreeMap<String, String>),
}

/// Variable data as it appears in a config's `variables` section or as
/// supplied by a collaborator (system plugin, scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawVar {
    /// A value that cannot be known yet.
    Deferred,
    Single(String),
    Map(BTreeMap<String, String>),
    List(Vec<RawItem>),
}

impl RawVar {
    /// Convert a config subtree (one entry of a `variables` mapping).
    pub fn from_config(name: &str, value: &ConfigValue) -> Result<RawVar> {
        match value {
            ConfigValue::Str(s) => Ok(RawVar::Single(s.clone())),
            ConfigValue::Map(map) => Ok(RawVar::Map(config_str_map(name, map)?)),
            ConfigValue::List(items) => {
                let raw_items = items
                    .iter()
                    .map(|item| match item {
                        ConfigValue::Str(s) => Ok(RawItem::Single(s.clone())),
                        ConfigValue::Map(map) => Ok(RawItem::Map(config_str_map(name, map)?)),
                        other => Err(ResolveError::structural(format!(
                            "variable '{name}': list elements must be strings or \
                             mappings, got a {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(RawVar::List(raw_items))
            }
            other => Err(ResolveError::structural(format!(
                "variable '{name}': values must be strings, lists, or mappings, \
                 got a {}",
                other.type_name()
            ))),
        }
    }
}

fn config_str_map(
    name: &str,
    map: &BTreeMap<String, ConfigValue>,
) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| match v {
            ConfigValue::Str(s) => Ok((k.clone(), s.clone())),
            other => Err(ResolveError::structural(format!(
                "variable '{name}': sub-key '{k}' must be a string, got a {}",
                other.type_name()
            ))),
        })
        .collect()
}

// ============================================================================
// THE STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VarStore {
    scopes: OrdMap<Scope, OrdMap<String, Variable>>,
}

impl VarStore {
    pub fn new() -> VarStore {
        VarStore::default()
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains_key(&scope)
    }

    /// Register a scope. Each scope may be added exactly once.
    pub fn add_scope(&mut self, scope: Scope, values: &BTreeMap<String, RawVar>) -> Result<()> {
        if self.has_scope(scope) {
            return Err(ResolveError::structural(format!(
                "variable scope '{scope}' is already loaded"
            )));
        }

        let mut vars = OrdMap::new();
        for (name, raw) in values {
            vars.insert(name.clone(), Variable::from_raw(scope, name, raw)?);
        }
        self.scopes.insert(scope, vars);
        Ok(())
    }

    /// Register a scope from a config `variables`-style mapping.
    pub fn add_config_scope(&mut self, scope: Scope, section: &ConfigValue) -> Result<()> {
        let map = match section {
            ConfigValue::Null => return self.add_scope(scope, &BTreeMap::new()),
            ConfigValue::Map(map) => map,
            other => {
                return Err(ResolveError::structural(format!(
                    "the '{scope}' variable section must be a mapping, got a {}",
                    other.type_name()
                )))
            }
        };

        let mut raw = BTreeMap::new();
        for (name, value) in map {
            raw.insert(name.clone(), RawVar::from_config(name, value)?);
        }
        self.add_scope(scope, &raw)
    }

    pub fn variable(&self, scope: Scope, name: &str) -> Option<&Variable> {
        self.scopes.get(&scope).and_then(|vars| vars.get(name))
    }

    /// Names defined in a scope, sorted.
    pub fn names(&self, scope: Scope) -> Vec<String> {
        self.scopes
            .get(&scope)
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Find the variable a key addresses. Unscoped keys use the priority
    /// search order.
    pub fn resolve_key(&self, vkey: &VarKey) -> Result<(Scope, &Variable)> {
        match vkey.scope {
            Some(scope) => {
                let vars = self.scopes.get(&scope).ok_or_else(|| {
                    ResolveError::reference(
                        vkey.to_string(),
                        format!("variable scope '{scope}' is not loaded"),
                    )
                })?;
                let var = vars.get(&vkey.name).ok_or_else(|| {
                    ResolveError::reference(
                        vkey.to_string(),
                        format!("no variable '{}' in scope '{scope}'", vkey.name),
                    )
                })?;
                Ok((scope, var))
            }
            None => {
                for scope in Scope::SEARCH_ORDER {
                    if let Some(var) = self.variable(scope, &vkey.name) {
                        return Ok((scope, var));
                    }
                }
                Err(ResolveError::reference(
                    vkey.to_string(),
                    "variable not defined in any loaded scope",
                ))
            }
        }
    }

    /// Get the concrete text for a key. Deferred reads are
    /// [`DeferredAccess`](crate::errors::ErrorKind::DeferredAccess) errors;
    /// out-of-range indexes are structural errors.
    pub fn get(&self, vkey: &VarKey) -> Result<String> {
        let (_, var) = self.resolve_key(vkey)?;

        let items = match var {
            Variable::Deferred => return Err(ResolveError::deferred(vkey.to_string())),
            Variable::Items(items) => items,
        };

        let idx = vkey.index.unwrap_or(0);
        let item = items.get(idx).ok_or_else(|| {
            ResolveError::structural(format!(
                "index {idx} out of range for variable '{vkey}' with {} value(s)",
                items.len()
            ))
        })?;

        let value = match item.get(vkey.subkey.as_deref()) {
            Some(value) => value,
            None => {
                let available: Vec<&str> =
                    item.subkeys().into_iter().filter(|k| !k.is_empty()).collect();
                let message = match &vkey.subkey {
                    Some(sub) => format!(
                        "no sub-key '{sub}'; available sub-keys: {}",
                        available.join(", ")
                    ),
                    None => format!(
                        "variable has sub-keys ({}); one must be specified",
                        available.join(", ")
                    ),
                };
                return Err(ResolveError::reference(vkey.to_string(), message));
            }
        };

        match value {
            VarValue::Concrete(text) => Ok(text.clone()),
            VarValue::Deferred { .. } => Err(ResolveError::deferred(vkey.to_string())),
        }
    }

    /// Parse and get in one step.
    pub fn get_text(&self, text: &str) -> Result<String> {
        self.get(&VarKey::parse(text)?)
    }

    /// Whether any part of the addressed variable is deferred.
    pub fn any_deferred(&self, vkey: &VarKey) -> Result<bool> {
        let (_, var) = self.resolve_key(vkey)?;
        Ok(match var {
            Variable::Deferred => true,
            Variable::Items(items) => items
                .iter()
                .any(|item| item.values().any(|(_, v)| v.is_deferred())),
        })
    }

    /// The number of items a variable holds. Deferred variables have no
    /// knowable length.
    pub fn len(&self, scope: Scope, name: &str) -> Result<usize> {
        let var = self.variable(scope, name).ok_or_else(|| {
            ResolveError::reference(
                format!("{scope}.{name}"),
                format!("no variable '{name}' in scope '{scope}'"),
            )
        })?;
        match var {
            Variable::Deferred => Err(ResolveError::deferred(format!("{scope}.{name}"))),
            Variable::Items(items) => Ok(items.len()),
        }
    }

    /// Whether anything anywhere in the store is still deferred.
    pub fn has_deferred(&self) -> bool {
        self.scopes.values().any(|vars| {
            vars.values().any(|var| match var {
                Variable::Deferred => true,
                Variable::Items(items) => items
                    .iter()
                    .any(|item| item.values().any(|(_, v)| v.is_deferred())),
            })
        })
    }

    fn set_value(
        &mut self,
        scope: Scope,
        name: &str,
        idx: usize,
        subkey: &str,
        value: VarValue,
    ) -> Result<()> {
        let located = self
            .scopes
            .get_mut(&scope)
            .and_then(|vars| vars.get_mut(name))
            .and_then(|var| match var {
                Variable::Items(items) => items.get_mut(idx),
                Variable::Deferred => None,
            });

        match located {
            Some(item) => {
                item.set(subkey, value);
                Ok(())
            }
            None => Err(ResolveError::reference(
                format!("{scope}.{name}.{idx}.{subkey}"),
                "no such value slot to assign",
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Permutation
    // ------------------------------------------------------------------------

    /// Expand the Cartesian product over the given `(scope, name)` pairs.
    ///
    /// Pairs are iterated in sorted order with the last pair varying
    /// fastest; downstream naming depends on that order being stable. Each
    /// output store pins its chosen values down to single-item sequences. A
    /// single total combination returns the store unchanged.
    pub fn get_permutations(&self, pairs: &[(Scope, String)]) -> Result<Vec<VarStore>> {
        let sorted = sort_pairs(pairs);

        let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
        for (scope, name) in &sorted {
            let count = self.len(*scope, name)?;
            let mut next = Vec::with_capacity(combos.len() * count);
            for combo in &combos {
                for idx in 0..count {
                    let mut extended = combo.clone();
                    extended.push(idx);
                    next.push(extended);
                }
            }
            combos = next;
        }

        if combos.len() <= 1 {
            return Ok(vec![self.clone()]);
        }

        combos
            .into_iter()
            .map(|combo| {
                let mut store = self.clone();
                for ((scope, name), idx) in sorted.iter().zip(combo) {
                    store.pin(*scope, name, idx)?;
                }
                Ok(store)
            })
            .collect()
    }

    /// Reduce a variable to the single item at `idx`.
    fn pin(&mut self, scope: Scope, name: &str, idx: usize) -> Result<()> {
        let var = self
            .scopes
            .get_mut(&scope)
            .and_then(|vars| vars.get_mut(name))
            .ok_or_else(|| {
                ResolveError::reference(
                    format!("{scope}.{name}"),
                    "cannot permute an undefined variable",
                )
            })?;

        match var {
            Variable::Deferred => Err(ResolveError::deferred(format!("{scope}.{name}"))),
            Variable::Items(items) => {
                let chosen = items
                    .get(idx)
                    .ok_or_else(|| {
                        ResolveError::structural(format!(
                            "permutation index {idx} out of range for '{scope}.{name}'"
                        ))
                    })?
                    .clone();
                *var = Variable::Items(vec![chosen]);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reference resolution
    // ------------------------------------------------------------------------

    /// Iteratively resolve every template value in the `var` scope.
    ///
    /// In partial mode, values that depend (directly or through other
    /// variables) on a name in `skip_names`, or on references that can't be
    /// looked up yet (typically `sched.*` before the scheduler scope
    /// exists), are left untouched. In non-partial mode every reference
    /// must be resolvable. Values depending on a deferred value become
    /// deferred themselves rather than failing.
    ///
    /// Returns `(resolved, could_resolve)`: the `var`-scope names that are
    /// now fully concrete, and the skipped names that would have resolved
    /// were they not skipped. A no-progress pass over mutually dependent
    /// values is a cycle error naming the full chain.
    pub fn resolve_references(
        &mut self,
        funcs: &FunctionRegistry,
        partial: bool,
        skip_names: &HashSet<String>,
    ) -> Result<(HashSet<String>, HashSet<String>)> {
        type EntryKey = (String, usize, String);

        // Collect entries that still contain expressions: concrete values
        // with expression spans, plus previously deferred values whose
        // recorded template may now be resolvable.
        let mut unresolved: BTreeMap<EntryKey, Template> = BTreeMap::new();
        let var_names = self.names(Scope::Var);

        for name in &var_names {
            let Some(Variable::Items(items)) = self.variable(Scope::Var, name) else {
                continue;
            };
            for (idx, item) in items.iter().enumerate() {
                for (subkey, value) in item.values() {
                    let text = match value {
                        VarValue::Concrete(text) => text,
                        VarValue::Deferred { raw: Some(text) } => text,
                        VarValue::Deferred { raw: None } => continue,
                    };
                    let template = Template::parse(text).frame_with(|| {
                        format!("in value of variable 'var.{name}.{idx}.{subkey}'")
                    })?;
                    if template.has_expressions() {
                        unresolved.insert((name.clone(), idx, subkey.to_string()), template);
                    }
                }
            }
        }

        // Names whose values were set aside, and why. Soft means "blocked
        // only by skipped names"; hard means a reference that can't be
        // looked up at all yet.
        let mut soft_names: HashSet<String> = HashSet::new();
        let mut hard_names: HashSet<String> = HashSet::new();
        let mut skip_closure: HashSet<String> = skip_names.clone();

        loop {
            let mut progress = false;
            let keys: Vec<EntryKey> = unresolved.keys().cloned().collect();

            'entries: for ekey in keys {
                let template = match unresolved.get(&ekey) {
                    Some(t) => t.clone(),
                    None => continue,
                };
                let (name, idx, subkey) = &ekey;

                let mut blocked_soft = false;
                let mut blocked_hard = false;
                let mut deferred_dep = false;

                for vref in template.refs() {
                    let unscoped_var =
                        vref.scope.is_none() || vref.scope == Some(Scope::Var);

                    if unscoped_var && skip_closure.contains(&vref.name) {
                        if hard_names.contains(&vref.name) {
                            blocked_hard = true;
                        } else {
                            blocked_soft = true;
                        }
                        continue;
                    }

                    // A reference into another still-unresolved value has
                    // to wait for it.
                    if unscoped_var {
                        let target = (
                            vref.name.clone(),
                            vref.index.unwrap_or(0),
                            vref.subkey.clone().unwrap_or_default(),
                        );
                        if target != ekey && unresolved.contains_key(&target) {
                            continue 'entries;
                        }
                        if target == ekey {
                            // Direct self-reference: treat as skip-blocked
                            // when skipped, a cycle otherwise.
                            if skip_closure.contains(&vref.name) {
                                blocked_soft = true;
                                continue;
                            }
                            continue 'entries;
                        }
                    }

                    match self.get(vref) {
                        Ok(_) => {}
                        Err(err) if err.is_deferred() => deferred_dep = true,
                        Err(err) => {
                            if partial {
                                blocked_hard = true;
                            } else {
                                return Err(err.context(format!(
                                    "in value of variable 'var.{name}.{idx}.{subkey}'"
                                )));
                            }
                        }
                    }
                }

                if blocked_hard || blocked_soft {
                    skip_closure.insert(name.clone());
                    if blocked_hard {
                        hard_names.insert(name.clone());
                    } else {
                        soft_names.insert(name.clone());
                    }
                    unresolved.remove(&ekey);
                    progress = true;
                    continue;
                }

                let value = if deferred_dep {
                    VarValue::Deferred {
                        raw: Some(template.source().to_string()),
                    }
                } else {
                    match template.render(self, funcs) {
                        Ok(text) => VarValue::Concrete(text),
                        Err(err) if err.is_deferred() => VarValue::Deferred {
                            raw: Some(template.source().to_string()),
                        },
                        Err(err) => {
                            return Err(err.context(format!(
                                "in value of variable 'var.{name}.{idx}.{subkey}'"
                            )))
                        }
                    }
                };

                self.set_value(Scope::Var, name, *idx, subkey, value)?;
                unresolved.remove(&ekey);
                progress = true;
            }

            if unresolved.is_empty() {
                break;
            }
            if !progress {
                return Err(ResolveError::cycle(reference_chain(&unresolved)));
            }
        }

        let resolved: HashSet<String> = var_names
            .iter()
            .filter(|name| !soft_names.contains(*name) && !hard_names.contains(*name))
            .cloned()
            .collect();

        let could_resolve: HashSet<String> = skip_names
            .iter()
            .filter(|name| {
                !hard_names.contains(*name)
                    && self.variable(Scope::Var, name).is_some()
            })
            .cloned()
            .collect();

        Ok((resolved, could_resolve))
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the store as JSON. Deferred values persist as sentinels.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| {
            ResolveError::structural(format!(
                "could not write variable file '{}'",
                path.display()
            ))
            .caused_by(e)
        })?;
        serde_json::to_writer(file, self).map_err(|e| {
            ResolveError::structural(format!(
                "could not serialize variables to '{}'",
                path.display()
            ))
            .caused_by(e)
        })
    }

    pub fn load(path: &Path) -> Result<VarStore> {
        let file = std::fs::File::open(path).map_err(|e| {
            ResolveError::structural(format!(
                "could not open variable file '{}'",
                path.display()
            ))
            .caused_by(e)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            ResolveError::structural(format!(
                "could not parse variable file '{}'",
                path.display()
            ))
            .caused_by(e)
        })
    }

    // ------------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------------

    /// Replace wholly deferred variables with values from a finalized
    /// store, then re-resolve the values that were deferred because they
    /// depended on them. Used once real node-side values exist.
    pub fn undefer(&mut self, finalized: &VarStore, funcs: &FunctionRegistry) -> Result<()> {
        for scope in Scope::SEARCH_ORDER {
            let Some(vars) = self.scopes.get(&scope) else {
                continue;
            };
            let deferred_names: Vec<String> = vars
                .iter()
                .filter(|(_, var)| matches!(var, Variable::Deferred))
                .map(|(name, _)| name.clone())
                .collect();

            for name in deferred_names {
                let replacement = finalized.variable(scope, &name).ok_or_else(|| {
                    ResolveError::reference(
                        format!("{scope}.{name}"),
                        "the finalized store carries no value for this deferred variable",
                    )
                })?;
                if matches!(replacement, Variable::Deferred) {
                    return Err(ResolveError::deferred(format!("{scope}.{name}")));
                }
                if let Some(vars) = self.scopes.get_mut(&scope) {
                    vars.insert(name, replacement.clone());
                }
            }
        }

        // Leaf-level deferred values keep their original template text;
        // replay resolution until they all land.
        loop {
            let mut pending: Vec<(String, usize, String, String)> = Vec::new();
            for name in self.names(Scope::Var) {
                let Some(Variable::Items(items)) = self.variable(Scope::Var, &name) else {
                    continue;
                };
                for (idx, item) in items.iter().enumerate() {
                    for (subkey, value) in item.values() {
                        if let VarValue::Deferred { raw: Some(text) } = value {
                            pending.push((name.clone(), idx, subkey.to_string(), text.clone()));
                        }
                    }
                }
            }

            if pending.is_empty() {
                break;
            }

            let mut progress = false;
            let mut stuck = Vec::new();
            for (name, idx, subkey, text) in pending {
                let template = Template::parse(&text)?;
                match template.render(self, funcs) {
                    Ok(resolved) => {
                        self.set_value(
                            Scope::Var,
                            &name,
                            idx,
                            &subkey,
                            VarValue::Concrete(resolved),
                        )?;
                        progress = true;
                    }
                    Err(err) if err.is_deferred() => {
                        stuck.push(format!("var.{name}.{idx}.{subkey}"));
                    }
                    Err(err) => return Err(err),
                }
            }

            if !progress {
                return Err(ResolveError::cycle(stuck));
            }
        }

        Ok(())
    }
}

impl VarLookup for VarStore {
    fn lookup(&self, vkey: &VarKey) -> Result<String> {
        self.get(vkey)
    }
}

/// Sort permutation pairs by scope name, then variable name. This matches
/// the order used for subtitle generation, so permuted test naming stays
/// stable.
pub fn sort_pairs(pairs: &[(Scope, String)]) -> Vec<(Scope, String)> {
    let mut sorted: Vec<(Scope, String)> = pairs.to_vec();
    sorted.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
    sorted.dedup();
    sorted
}

/// Lay out the remaining mutually dependent values as a readable chain.
fn reference_chain(unresolved: &BTreeMap<(String, usize, String), Template>) -> Vec<String> {
    let display = |(name, idx, subkey): &(String, usize, String)| {
        let mut out = format!("var.{name}");
        if *idx != 0 {
            out.push_str(&format!(".{idx}"));
        }
        if !subkey.is_empty() {
            out.push_str(&format!(".{subkey}"));
        }
        out
    };

    let Some(start) = unresolved.keys().next() else {
        return Vec::new();
    };

    let mut chain = vec![display(start)];
    let mut seen = HashSet::new();
    let mut current = start.clone();
    seen.insert(current.clone());

    loop {
        let Some(template) = unresolved.get(&current) else {
            break;
        };
        let next = template.refs().iter().find_map(|vref| {
            let target = (
                vref.name.clone(),
                vref.index.unwrap_or(0),
                vref.subkey.clone().unwrap_or_default(),
            );
            unresolved.contains_key(&target).then_some(target)
        });

        match next {
            Some(target) => {
                chain.push(display(&target));
                if !seen.insert(target.clone()) {
                    break;
                }
                current = target;
            }
            None => break,
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::build_default_function_registry;

    fn raw_list(values: &[&str]) -> RawVar {
        RawVar::List(values.iter().map(|v| RawItem::Single(v.to_string())).collect())
    }

    fn store_with_vars(vars: &[(&str, RawVar)]) -> VarStore {
        let mut store = VarStore::new();
        let values: BTreeMap<String, RawVar> = vars
            .iter()
            .map(|(name, raw)| (name.to_string(), raw.clone()))
            .collect();
        store.add_scope(Scope::Var, &values).unwrap();
        store
    }

    #[test]
    fn scope_can_only_load_once() {
        let mut store = store_with_vars(&[("a", RawVar::Single("1".into()))]);
        let err = store.add_scope(Scope::Var, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind().category(), "structural");
    }

    #[test]
    fn inconsistent_subkeys_are_rejected() {
        let mut one = BTreeMap::new();
        one.insert("p".to_string(), "1".to_string());
        let mut two = BTreeMap::new();
        two.insert("q".to_string(), "2".to_string());

        let raw = RawVar::List(vec![RawItem::Map(one), RawItem::Map(two)]);
        let err = Variable::from_raw(Scope::Var, "bad", &raw).unwrap_err();
        assert_eq!(err.kind().category(), "structural");
    }

    #[test]
    fn priority_search_prefers_var_scope() {
        let mut store = store_with_vars(&[("host", RawVar::Single("from_var".into()))]);
        let mut sys = BTreeMap::new();
        sys.insert("host".to_string(), RawVar::Single("from_sys".into()));
        sys.insert("arch".to_string(), RawVar::Single("x86_64".into()));
        store.add_scope(Scope::Sys, &sys).unwrap();

        assert_eq!(store.get_text("host").unwrap(), "from_var");
        assert_eq!(store.get_text("sys.host").unwrap(), "from_sys");
        assert_eq!(store.get_text("arch").unwrap(), "x86_64");
    }

    #[test]
    fn deferred_reads_are_typed_errors() {
        let mut sys = BTreeMap::new();
        sys.insert("node_id".to_string(), RawVar::Deferred);
        let mut store = VarStore::new();
        store.add_scope(Scope::Sys, &sys).unwrap();

        let err = store.get_text("sys.node_id").unwrap_err();
        assert!(err.is_deferred());
        assert!(store.any_deferred(&VarKey::parse("node_id").unwrap()).unwrap());
        assert!(store.len(Scope::Sys, "node_id").unwrap_err().is_deferred());
    }

    #[test]
    fn index_out_of_range_is_structural() {
        let store = store_with_vars(&[("foo", raw_list(&["a", "b"]))]);
        let err = store.get_text("foo.5").unwrap_err();
        assert_eq!(err.kind().category(), "structural");
    }

    #[test]
    fn permutations_pin_each_value_once() {
        let store = store_with_vars(&[("foo", raw_list(&["1", "2", "3"]))]);
        let permuted = store
            .get_permutations(&[(Scope::Var, "foo".to_string())])
            .unwrap();

        assert_eq!(permuted.len(), 3);
        let mut pinned: Vec<String> = permuted
            .iter()
            .map(|s| s.get_text("foo").unwrap())
            .collect();
        pinned.sort();
        assert_eq!(pinned, vec!["1", "2", "3"]);
        for store in &permuted {
            assert_eq!(store.len(Scope::Var, "foo").unwrap(), 1);
        }
    }

    #[test]
    fn permutation_order_varies_last_sorted_pair_fastest() {
        let store = store_with_vars(&[
            ("a", raw_list(&["1", "2"])),
            ("b", raw_list(&["x", "y"])),
        ]);
        let permuted = store
            .get_permutations(&[
                (Scope::Var, "b".to_string()),
                (Scope::Var, "a".to_string()),
            ])
            .unwrap();

        let order: Vec<(String, String)> = permuted
            .iter()
            .map(|s| (s.get_text("a").unwrap(), s.get_text("b").unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("1".to_string(), "x".to_string()),
                ("1".to_string(), "y".to_string()),
                ("2".to_string(), "x".to_string()),
                ("2".to_string(), "y".to_string()),
            ]
        );
    }

    #[test]
    fn single_combination_returns_store_unchanged() {
        let store = store_with_vars(&[("solo", raw_list(&["only"]))]);
        let permuted = store
            .get_permutations(&[(Scope::Var, "solo".to_string())])
            .unwrap();
        assert_eq!(permuted.len(), 1);
        assert_eq!(permuted[0], store);
    }

    #[test]
    fn references_resolve_through_chains() {
        let funcs = build_default_function_registry();
        let mut store = store_with_vars(&[
            ("a", RawVar::Single("{{b}}-end".into())),
            ("b", RawVar::Single("{{c}}".into())),
            ("c", RawVar::Single("42".into())),
        ]);

        let (resolved, _) = store
            .resolve_references(&funcs, false, &HashSet::new())
            .unwrap();

        assert_eq!(store.get_text("a").unwrap(), "42-end");
        assert_eq!(store.get_text("b").unwrap(), "42");
        assert!(resolved.contains("a") && resolved.contains("b") && resolved.contains("c"));
    }

    #[test]
    fn reference_loops_name_the_chain() {
        let funcs = build_default_function_registry();
        let mut store = store_with_vars(&[
            ("x", RawVar::Single("{{y}}".into())),
            ("y", RawVar::Single("{{x}}".into())),
        ]);

        let err = store
            .resolve_references(&funcs, false, &HashSet::new())
            .unwrap_err();
        match err.kind() {
            crate::errors::ErrorKind::Cycle { chain } => {
                assert!(chain.iter().any(|c| c.contains('x')));
                assert!(chain.iter().any(|c| c.contains('y')));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn partial_mode_skips_and_reports_could_resolve() {
        let funcs = build_default_function_registry();
        let mut store = store_with_vars(&[
            // References itself through its own sub-values.
            ("twisty", RawVar::Single("{{twisty}}".into())),
            ("plain", raw_list(&["1", "2"])),
            ("depends", RawVar::Single("{{plain}}!".into())),
        ]);

        let skips: HashSet<String> = ["twisty".to_string()].into();
        let (resolved, could) = store.resolve_references(&funcs, true, &skips).unwrap();

        assert!(resolved.contains("plain"));
        assert!(resolved.contains("depends"));
        assert!(!resolved.contains("twisty"));
        assert!(could.contains("twisty"));
        assert_eq!(store.get_text("depends").unwrap(), "1!");
    }

    #[test]
    fn unknown_sched_refs_block_only_in_partial_mode() {
        let funcs = build_default_function_registry();
        let mut store = store_with_vars(&[
            ("nodes", RawVar::Single("{{sched.node_count}}".into())),
            ("fine", RawVar::Single("ok".into())),
        ]);

        let (resolved, could) = store
            .resolve_references(&funcs, true, &HashSet::new())
            .unwrap();
        assert!(resolved.contains("fine"));
        assert!(!resolved.contains("nodes"));
        assert!(could.is_empty());
        // The value is untouched, ready for the scheduler phase.
        assert_eq!(store.get_text("nodes").unwrap(), "{{sched.node_count}}");

        let err = store
            .resolve_references(&funcs, false, &HashSet::new())
            .unwrap_err();
        assert_eq!(err.kind().category(), "reference");
    }

    #[test]
    fn deferred_dependencies_propagate_as_deferred() {
        let funcs = build_default_function_registry();
        let mut sys = BTreeMap::new();
        sys.insert("node_id".to_string(), RawVar::Deferred);

        let mut store = store_with_vars(&[(
            "ident",
            RawVar::Single("node-{{sys.node_id}}".into()),
        )]);
        store.add_scope(Scope::Sys, &sys).unwrap();

        store
            .resolve_references(&funcs, false, &HashSet::new())
            .unwrap();
        assert!(store.get_text("ident").unwrap_err().is_deferred());
    }

    #[test]
    fn save_load_round_trips_including_deferred() {
        let mut sys = BTreeMap::new();
        sys.insert("host".to_string(), RawVar::Single("login1".into()));
        sys.insert("node_id".to_string(), RawVar::Deferred);

        let mut store = store_with_vars(&[
            ("foo", raw_list(&["1", "2"])),
        ]);
        store.add_scope(Scope::Sys, &sys).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.json");
        store.save(&path).unwrap();
        let loaded = VarStore::load(&path).unwrap();

        assert_eq!(loaded, store);
        assert!(loaded.get_text("sys.node_id").unwrap_err().is_deferred());
    }

    #[test]
    fn undefer_fills_in_finalized_values() {
        let funcs = build_default_function_registry();

        let mut sys = BTreeMap::new();
        sys.insert("node_id".to_string(), RawVar::Deferred);
        let mut store = store_with_vars(&[(
            "ident",
            RawVar::Single("node-{{sys.node_id}}".into()),
        )]);
        store.add_scope(Scope::Sys, &sys).unwrap();
        store
            .resolve_references(&funcs, false, &HashSet::new())
            .unwrap();

        let mut final_sys = BTreeMap::new();
        final_sys.insert("node_id".to_string(), RawVar::Single("n0042".into()));
        let mut finalized = VarStore::new();
        finalized.add_scope(Scope::Sys, &final_sys).unwrap();

        store.undefer(&finalized, &funcs).unwrap();
        assert_eq!(store.get_text("ident").unwrap(), "node-n0042");
        assert!(!store.has_deferred());
    }
}
