//! The scheduler seam.
//!
//! Schedulers are external collaborators: they answer for `sched.*`
//! variables and know which of them can only be determined once a test has
//! an allocation. The resolution engine calls them synchronously through
//! this trait and surfaces their failures as typed scheduler errors.

use std::collections::{BTreeMap, HashMap};

use crate::config::ConfigValue;
use crate::errors::{ResolveError, Result, ResultExt};
use crate::vars::RawVar;

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this scheduler can actually run tests on this system.
    fn available(&self) -> bool {
        true
    }

    /// The scheduler variables knowable before allocation, given the
    /// test's resolved `schedule` section. Values that depend on the
    /// allocation itself come back as [`RawVar::Deferred`].
    fn get_initial_vars(&self, schedule: &ConfigValue) -> Result<BTreeMap<String, RawVar>>;

    /// The concrete values for everything, gathered on the allocation.
    fn get_final_vars(&self, schedule: &ConfigValue) -> Result<BTreeMap<String, RawVar>>;
}

impl std::fmt::Debug for dyn Scheduler + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("name", &self.name()).finish()
    }
}

#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: HashMap<String, Box<dyn Scheduler>>,
}

impl SchedulerRegistry {
    pub fn new() -> SchedulerRegistry {
        SchedulerRegistry::default()
    }

    pub fn register(&mut self, scheduler: Box<dyn Scheduler>) {
        self.schedulers.insert(scheduler.name().to_string(), scheduler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schedulers.contains_key(name)
    }

    /// Look up a scheduler, requiring that it be usable here.
    pub fn get(&self, name: &str) -> Result<&dyn Scheduler> {
        let scheduler = self
            .schedulers
            .get(name)
            .ok_or_else(|| {
                ResolveError::scheduler(name, "no such scheduler plugin is registered")
            })?
            .as_ref();

        if !scheduler.available() {
            return Err(ResolveError::scheduler(
                name,
                "the scheduler is not available on this system",
            ));
        }
        Ok(scheduler)
    }

    /// Fetch a scheduler's initial variables, wrapping plugin failures.
    pub fn initial_vars(
        &self,
        name: &str,
        schedule: &ConfigValue,
    ) -> Result<BTreeMap<String, RawVar>> {
        self.get(name)?
            .get_initial_vars(schedule)
            .frame_with(|| format!("gathering initial variables from scheduler '{name}'"))
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.schedulers.keys().collect();
        names.sort();
        f.debug_struct("SchedulerRegistry")
            .field("schedulers", &names)
            .finish()
    }
}
