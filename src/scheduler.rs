//! Dependency bookkeeping for a single job.
//!
//! The scheduler is a pure state machine: it never runs anything. The
//! executor feeds it task outcomes and gets back the tasks that became
//! ready and the ones that can no longer run.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::graph::model::{InputRef, TaskId};
use crate::graph::validator::ValidatedGraph;

/// Result of feeding one event to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Tasks whose dependencies are now all completed
    pub newly_ready: Vec<String>,
    /// Tasks that will never run because an upstream failed
    pub newly_failed: Vec<String>,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.newly_ready.is_empty() && self.newly_failed.is_empty()
    }
}

pub struct Scheduler {
    /// Task names in submission order
    names: Vec<String>,

    /// Remaining unmet dependencies per task (distinct inputs only)
    remaining: HashMap<String, usize>,

    /// If task B consumes task A, then dependency_index[A] contains B
    dependency_index: HashMap<String, Vec<String>>,

    /// Same mapping for inputs owned by other jobs
    external_index: HashMap<TaskId, Vec<String>>,

    released: HashSet<String>,
    settled: HashSet<String>,
}

impl Scheduler {
    pub fn new(graph: &ValidatedGraph) -> Self {
        let names = graph.task_names().to_vec();
        let mut remaining = HashMap::with_capacity(names.len());
        let mut dependency_index: HashMap<String, Vec<String>> = HashMap::new();
        let mut external_index: HashMap<TaskId, Vec<String>> = HashMap::new();

        for name in &names {
            let distinct: HashSet<&InputRef> = graph.inputs(name).iter().collect();
            remaining.insert(name.clone(), distinct.len());

            for input in distinct {
                let index = match input {
                    InputRef::Task(dep) => dependency_index.entry(dep.clone()),
                    InputRef::External(id) => external_index.entry(id.clone()),
                };
                index.or_default().push(name.clone());
            }
        }

        Self {
            names,
            remaining,
            dependency_index,
            external_index,
            released: HashSet::new(),
            settled: HashSet::new(),
        }
    }

    /// Tasks with no unmet dependencies. Each is released only once.
    pub fn initial_ready(&mut self) -> SchedulerStep {
        let ready: Vec<String> = self
            .names
            .iter()
            .filter(|name| self.remaining.get(*name) == Some(&0))
            .cloned()
            .collect();
        let newly_ready = ready
            .into_iter()
            .filter(|name| self.release(name))
            .collect();
        SchedulerStep {
            newly_ready,
            newly_failed: Vec::new(),
        }
    }

    pub fn on_completed(&mut self, name: &str) -> SchedulerStep {
        if !self.settled.insert(name.to_string()) {
            return SchedulerStep::default();
        }
        let dependents = self.dependency_index.get(name).cloned().unwrap_or_default();
        debug!(task = %name, dependents = dependents.len(), "dependency completed");
        self.satisfy(dependents)
    }

    /// Settle the task and every transitive dependent not yet settled
    pub fn on_failed(&mut self, name: &str) -> SchedulerStep {
        if !self.settled.insert(name.to_string()) {
            return SchedulerStep::default();
        }
        let dependents = self.dependency_index.get(name).cloned().unwrap_or_default();
        self.propagate(dependents)
    }

    pub fn on_external_completed(&mut self, id: &str) -> SchedulerStep {
        let dependents = self.external_index.remove(id).unwrap_or_default();
        debug!(external = %id, dependents = dependents.len(), "external input completed");
        self.satisfy(dependents)
    }

    pub fn on_external_failed(&mut self, id: &str) -> SchedulerStep {
        let dependents = self.external_index.remove(id).unwrap_or_default();
        self.propagate(dependents)
    }

    /// Record a task settled outside the normal flow (e.g. cancellation)
    pub fn mark_settled(&mut self, name: &str) {
        self.settled.insert(name.to_string());
    }

    /// External task ids still awaited
    pub fn pending_externals(&self) -> Vec<TaskId> {
        self.external_index.keys().cloned().collect()
    }

    pub fn is_finished(&self) -> bool {
        self.names.iter().all(|name| self.settled.contains(name))
    }

    fn release(&mut self, name: &str) -> bool {
        !self.settled.contains(name) && self.released.insert(name.to_string())
    }

    fn satisfy(&mut self, dependents: Vec<String>) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        for dependent in dependents {
            if self.settled.contains(&dependent) {
                continue;
            }
            if let Some(count) = self.remaining.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.release(&dependent) {
                    step.newly_ready.push(dependent);
                }
            }
        }
        self.sort(&mut step.newly_ready);
        step
    }

    fn propagate(&mut self, dependents: Vec<String>) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        let mut queue: VecDeque<String> = dependents.into();
        while let Some(task) = queue.pop_front() {
            if !self.settled.insert(task.clone()) {
                continue;
            }
            if let Some(next) = self.dependency_index.get(&task) {
                queue.extend(next.iter().cloned());
            }
            step.newly_failed.push(task);
        }
        self.sort(&mut step.newly_failed);
        debug!(failed = ?step.newly_failed, "failure propagated");
        step
    }

    fn sort(&self, tasks: &mut [String]) {
        tasks.sort_by_key(|name| self.names.iter().position(|n| n == name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::operations::register_builtin_operations;
    use crate::executor::registry::OperationRegistry;
    use crate::graph::spec::{JobSpec, TaskSpec};
    use crate::graph::validator::GraphValidator;
    use pretty_assertions::assert_eq;

    fn validate(spec: &JobSpec, externals: &[&str]) -> ValidatedGraph {
        let registry = OperationRegistry::new();
        register_builtin_operations(&registry, &Default::default());
        let known = |id: &str| externals.contains(&id);
        GraphValidator::new(&registry, &known)
            .validate(spec)
            .unwrap()
    }

    fn import(url: &str) -> TaskSpec {
        TaskSpec::new("import/url").param("url", url)
    }

    fn diamond() -> JobSpec {
        JobSpec::new()
            .task("a", import("https://example.com/a.png"))
            .task("b", TaskSpec::new("convert").input("a").output_format("jpg"))
            .task("c", TaskSpec::new("convert").input("a").output_format("webp"))
            .task("d", TaskSpec::new("merge").inputs(["b", "c"]).output_format("pdf"))
    }

    #[test]
    fn test_diamond_releases_join_once() {
        let mut scheduler = Scheduler::new(&validate(&diamond(), &[]));

        assert_eq!(scheduler.initial_ready().newly_ready, vec!["a"]);
        assert!(scheduler.initial_ready().newly_ready.is_empty());
        assert_eq!(scheduler.on_completed("a").newly_ready, vec!["b", "c"]);
        assert!(scheduler.on_completed("b").newly_ready.is_empty());
        assert_eq!(scheduler.on_completed("c").newly_ready, vec!["d"]);
        assert!(!scheduler.is_finished());
        scheduler.on_completed("d");
        assert!(scheduler.is_finished());
    }

    #[test]
    fn test_failure_propagates_transitively_only_downstream() {
        let spec = diamond()
            .task("e", import("https://example.com/e.png"))
            .task("f", TaskSpec::new("export/url").input("d"));
        let mut scheduler = Scheduler::new(&validate(&spec, &[]));

        assert_eq!(scheduler.initial_ready().newly_ready, vec!["a", "e"]);
        scheduler.on_completed("a");
        let step = scheduler.on_failed("b");
        assert_eq!(step.newly_failed, vec!["d", "f"]);
        assert!(step.newly_ready.is_empty());

        // c finishing must not release d any more
        assert!(scheduler.on_completed("c").is_empty());
        scheduler.on_completed("e");
        assert!(scheduler.is_finished());
    }

    #[test]
    fn test_duplicate_input_counts_once() {
        let spec = JobSpec::new()
            .task("a", import("https://example.com/a.png"))
            .task("m", TaskSpec::new("merge").inputs(["a", "a"]).output_format("pdf"));
        let mut scheduler = Scheduler::new(&validate(&spec, &[]));
        scheduler.initial_ready();
        assert_eq!(scheduler.on_completed("a").newly_ready, vec!["m"]);
    }

    #[test]
    fn test_external_inputs() {
        let spec = JobSpec::new()
            .task("a", import("https://example.com/a.png"))
            .task("m", TaskSpec::new("merge").inputs(["a", "ext-1"]).output_format("pdf"))
            .task("x", TaskSpec::new("export/url").input("m"));
        let mut scheduler = Scheduler::new(&validate(&spec, &["ext-1"]));

        assert_eq!(scheduler.initial_ready().newly_ready, vec!["a"]);
        assert_eq!(scheduler.pending_externals(), vec!["ext-1".to_string()]);
        assert!(scheduler.on_completed("a").newly_ready.is_empty());

        let step = scheduler.on_external_failed("ext-1");
        assert_eq!(step.newly_failed, vec!["m", "x"]);
        assert!(scheduler.is_finished());
        assert!(scheduler.on_external_completed("ext-1").is_empty());
    }
}
