//! pavise: a test configuration resolution engine.
//!
//! Test suites arrive as raw YAML-shaped config trees; pavise turns each
//! test into one or more ready-to-run configurations. The pipeline:
//!
//! 1. **Inheritance** ([`inherit`]) flattens each suite's test hierarchy
//!    onto an implicit base config.
//! 2. **Overrides** ([`overrides`]) apply `key.path=value` command-line
//!    edits, all-or-nothing.
//! 3. **Permutation** ([`permute`]) expands `permute_on` variables into
//!    the Cartesian product of their values, each permutation carrying its
//!    own pinned variable store ([`vars`]).
//! 4. **Final substitution** ([`resolve`]) renders every config string
//!    through the template language ([`template`]), fanned out over a
//!    worker pool ([`pool`]).
//!
//! Values a system genuinely cannot know before a test reaches its
//! allocation are *deferred*: tracked through resolution, persisted as
//! sentinels, and finished node-side via [`vars::VarStore::undefer`] and
//! [`resolve::resolve_deferred`].
//!
//! The [`resolver::TestResolver`] driver ties the phases together;
//! schedulers plug in through the [`sched::Scheduler`] trait.

pub mod config;
pub mod errors;
pub mod inherit;
pub mod overrides;
pub mod permute;
pub mod pool;
pub mod resolve;
pub mod resolver;
pub mod sched;
pub mod template;
pub mod vars;

pub use config::ConfigValue;
pub use errors::{ErrorKind, ResolveError, Result};
pub use permute::resolve_permutations;
pub use resolve::{resolve_config, resolve_deferred, DEFERRED_PREFIX};
pub use resolver::{ProtoTest, TestResolver};
pub use sched::{Scheduler, SchedulerRegistry};
pub use template::{build_default_function_registry, FunctionRegistry, Template};
pub use vars::{RawItem, RawVar, Scope, VarKey, VarStore};

/// The running version, checked against configs' `compatible_versions`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
