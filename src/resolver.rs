//! The top-level resolution driver.
//!
//! `TestResolver` ties the phases together: suite inheritance, command
//! line overrides, version compatibility, permutation expansion, and the
//! final parallel string substitution. Output is a flat list of
//! [`ProtoTest`]s, each a fully resolved config paired with the store that
//! resolved it.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};
use crate::inherit::{check_version_compatibility, resolve_inheritance};
use crate::overrides::apply_overrides;
use crate::permute::resolve_permutations;
use crate::pool::TaskPool;
use crate::resolve::resolve_config;
use crate::sched::SchedulerRegistry;
use crate::template::FunctionRegistry;
use crate::vars::{Scope, VarStore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One resolvable test: a config and the variable store that goes with it.
#[derive(Debug, Clone)]
pub struct ProtoTest {
    pub config: ConfigValue,
    pub store: VarStore,
}

pub struct TestResolver<'a> {
    base_store: VarStore,
    schedulers: &'a SchedulerRegistry,
    funcs: &'a FunctionRegistry,
    max_workers: usize,
}

impl<'a> TestResolver<'a> {
    /// Build a resolver around the host's base store. The base store
    /// carries the `sys` and `pav` scopes; missing ones are added empty.
    pub fn new(
        mut base_store: VarStore,
        schedulers: &'a SchedulerRegistry,
        funcs: &'a FunctionRegistry,
    ) -> Result<TestResolver<'a>> {
        for scope in [Scope::Sys, Scope::Pav] {
            if !base_store.has_scope(scope) {
                base_store.add_scope(scope, &BTreeMap::new())?;
            }
        }
        Ok(TestResolver {
            base_store,
            schedulers,
            funcs,
            max_workers: 1,
        })
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> TestResolver<'a> {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Resolve a whole suite down to ready-to-run prototests.
    pub fn resolve_suite(
        &self,
        suite_name: &str,
        suite: &BTreeMap<String, ConfigValue>,
        base: &ConfigValue,
        overrides: &[String],
    ) -> Result<Vec<ProtoTest>> {
        info!(suite = %suite_name, tests = suite.len(), "resolving suite");
        let tests = resolve_inheritance(suite_name, suite, base)?;

        let mut pending = Vec::new();
        for (test_name, config) in &tests {
            let permuted = self
                .resolve_test(config, overrides)
                .frame_with(|| format!("test '{test_name}' in suite '{suite_name}'"))?;
            debug!(
                test = %test_name,
                permutations = permuted.stores.len(),
                "expanded test"
            );
            for store in permuted.stores {
                pending.push(ProtoTest {
                    config: permuted.config.clone(),
                    store,
                });
            }
        }

        let resolved = self
            .resolve_batch(pending)
            .frame_with(|| format!("in suite '{suite_name}'"))?;
        info!(suite = %suite_name, prototests = resolved.len(), "suite resolved");
        Ok(resolved)
    }

    /// Run one test config through overrides, version checking, variable
    /// setup, and permutation.
    fn resolve_test(
        &self,
        config: &ConfigValue,
        overrides: &[String],
    ) -> Result<crate::permute::PermutedConfig> {
        let config = apply_overrides(config, overrides)?;
        check_version_compatibility(&config, crate::VERSION)?;

        let mut store = self.base_store.clone();
        store.add_config_scope(
            Scope::Var,
            config.get("variables").unwrap_or(&ConfigValue::Null),
        )?;

        resolve_permutations(&config, &store, self.schedulers, self.funcs)
    }

    /// Final substitution over a batch of prototests, fanned out over the
    /// worker pool. The first failure aborts the whole batch.
    pub fn resolve_batch(&self, pending: Vec<ProtoTest>) -> Result<Vec<ProtoTest>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        // A single test isn't worth a pool.
        if pending.len() == 1 {
            let proto = pending.into_iter().next().ok_or_else(|| {
                ResolveError::structural("batch unexpectedly empty")
            })?;
            return Ok(vec![finalize(proto, self.funcs)?]);
        }

        let jobs = pending.len();
        let workers = self.max_workers.min(jobs);
        debug!(jobs, workers, "resolving batch");

        let funcs = self.funcs.clone();
        let mut pool: TaskPool<(usize, ProtoTest), (usize, Result<ProtoTest>)> =
            TaskPool::new(workers, move |(idx, proto)| (idx, finalize(proto, &funcs)));

        for job in pending.into_iter().enumerate() {
            pool.submit(job)?;
        }
        pool.close();

        let mut finished: Vec<Option<ProtoTest>> = (0..jobs).map(|_| None).collect();
        while pool.outstanding() > 0 {
            if let Some((idx, result)) = pool.poll(POLL_INTERVAL)? {
                finished[idx] = Some(result?);
            }
        }

        finished
            .into_iter()
            .map(|proto| {
                proto.ok_or_else(|| ResolveError::structural("a batch job produced no result"))
            })
            .collect()
    }
}

/// Final substitution for one prototest, with the test's name attached to
/// any failure.
fn finalize(proto: ProtoTest, funcs: &FunctionRegistry) -> Result<ProtoTest> {
    let name = proto
        .config
        .get("name")
        .and_then(ConfigValue::as_str)
        .unwrap_or("<unnamed>")
        .to_string();

    let config = resolve_config(&proto.config, &proto.store, funcs)
        .frame_with(|| format!("resolving test '{name}'"))?;
    Ok(ProtoTest {
        config,
        store: proto.store,
    })
}
