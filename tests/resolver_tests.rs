//! End-to-end resolution through the driver.

use std::collections::BTreeMap;

use pavise::config::ConfigValue;
use pavise::errors::Result;
use pavise::resolve::{resolve_deferred, DEFERRED_PREFIX};
use pavise::sched::{Scheduler, SchedulerRegistry};
use pavise::template::build_default_function_registry;
use pavise::vars::{RawVar, Scope, VarStore};
use pavise::TestResolver;

struct StubSched;

impl Scheduler for StubSched {
    fn name(&self) -> &str {
        "raw"
    }

    fn get_initial_vars(&self, _: &ConfigValue) -> Result<BTreeMap<String, RawVar>> {
        let mut vars = BTreeMap::new();
        vars.insert("node_count".to_string(), RawVar::Single("4".to_string()));
        vars.insert("node_list".to_string(), RawVar::Deferred);
        Ok(vars)
    }

    fn get_final_vars(&self, _: &ConfigValue) -> Result<BTreeMap<String, RawVar>> {
        let mut vars = BTreeMap::new();
        vars.insert("node_count".to_string(), RawVar::Single("4".to_string()));
        vars.insert(
            "node_list".to_string(),
            RawVar::Single("node[01-04]".to_string()),
        );
        Ok(vars)
    }
}

fn registry() -> SchedulerRegistry {
    let mut registry = SchedulerRegistry::new();
    registry.register(Box::new(StubSched));
    registry
}

fn yaml(text: &str) -> ConfigValue {
    let value: serde_yaml::Value = serde_yaml::from_str(text).unwrap();
    ConfigValue::from_yaml(&value).unwrap()
}

fn suite(text: &str) -> BTreeMap<String, ConfigValue> {
    yaml(text).as_map().unwrap().clone()
}

#[test]
fn inherited_permuted_overridden_suites_resolve() {
    let schedulers = registry();
    let funcs = build_default_function_registry();
    let resolver = TestResolver::new(VarStore::new(), &schedulers, &funcs)
        .unwrap()
        .with_max_workers(4);

    let base = yaml("run:\n  timeout: '300'");
    let tests = suite(
        "parent:\n  variables:\n    app: ./a.out\n  run:\n    cmds: ['{{app}} -n {{procs}}']\n\
         child:\n  inherits_from: parent\n  permute_on: [procs]\n  variables:\n    procs: ['2', '4']",
    );

    let protos = resolver
        .resolve_suite(
            "demo",
            &tests,
            &base,
            &["run.timeout=60".to_string(), "variables.procs=[2, 4]".to_string()],
        )
        .unwrap();

    // 'parent' also needs a procs value via the override; it permutes on
    // nothing, so one prototest, plus two for 'child'.
    assert_eq!(protos.len(), 3);

    let mut child_cmds = Vec::new();
    for proto in &protos {
        assert_eq!(
            proto.config.get("run").unwrap().get("timeout"),
            Some(&"60".into())
        );
        if proto.config.get("name") == Some(&"child".into()) {
            let cmds = proto.config.get("run").unwrap().get("cmds").unwrap();
            child_cmds.push(cmds.as_list().unwrap()[0].as_str().unwrap().to_string());
        }
    }
    child_cmds.sort();
    assert_eq!(child_cmds, vec!["./a.out -n 2", "./a.out -n 4"]);
}

#[test]
fn incompatible_versions_stop_resolution() {
    let schedulers = registry();
    let funcs = build_default_function_registry();
    let resolver = TestResolver::new(VarStore::new(), &schedulers, &funcs).unwrap();

    let tests = suite("t:\n  compatible_versions: '99.0'\n  run:\n    cmds: ['true']");
    let err = resolver
        .resolve_suite("demo", &tests, &ConfigValue::map(), &[])
        .unwrap_err();
    assert_eq!(err.kind().category(), "version");
}

#[test]
fn missing_schedulers_are_typed_errors() {
    let schedulers = SchedulerRegistry::new();
    let funcs = build_default_function_registry();
    let resolver = TestResolver::new(VarStore::new(), &schedulers, &funcs).unwrap();

    let tests = suite("t:\n  scheduler: slurm\n  run:\n    cmds: ['true']");
    let err = resolver
        .resolve_suite("demo", &tests, &ConfigValue::map(), &[])
        .unwrap_err();
    assert_eq!(err.kind().category(), "scheduler");
}

#[test]
fn deferred_values_survive_save_load_and_finish_node_side() {
    let schedulers = registry();
    let funcs = build_default_function_registry();
    let resolver = TestResolver::new(VarStore::new(), &schedulers, &funcs).unwrap();

    let tests = suite("t:\n  run:\n    cmds: ['hostname > {{sched.node_list}}.log']");
    let protos = resolver
        .resolve_suite("demo", &tests, &ConfigValue::map(), &[])
        .unwrap();
    assert_eq!(protos.len(), 1);

    // The run command waits for the allocation, behind the sentinel.
    let cmds = protos[0].config.get("run").unwrap().get("cmds").unwrap();
    let cmd = cmds.as_list().unwrap()[0].as_str().unwrap();
    assert!(cmd.starts_with(DEFERRED_PREFIX), "got: {cmd}");

    // Round-trip the store the way a queued test would.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("variables.json");
    protos[0].store.save(&path).unwrap();
    let mut store = VarStore::load(&path).unwrap();
    assert_eq!(store, protos[0].store);

    // Node-side: real scheduler values arrive, everything resolves.
    let mut finalized = VarStore::new();
    finalized
        .add_scope(
            Scope::Sched,
            &StubSched.get_final_vars(&ConfigValue::map()).unwrap(),
        )
        .unwrap();
    store.undefer(&finalized, &funcs).unwrap();

    let finished = resolve_deferred(&protos[0].config, &store, &funcs).unwrap();
    assert_eq!(
        finished.get("run").unwrap().get("cmds"),
        Some(&["hostname > node[01-04].log"].into())
    );
}
