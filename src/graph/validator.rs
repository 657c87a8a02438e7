//! Submission-time validation of a job graph.
//!
//! All checks run before anything executes and every violation found is
//! reported, not just the first one.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::executor::registry::OperationRegistry;
use crate::graph::model::{InputRef, TaskId};
use crate::graph::spec::JobSpec;

/// A single reason a job graph was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("job has no tasks")]
    EmptyJob,

    #[error("task name '{name}' is invalid (must be non-empty, without '.' or whitespace)")]
    InvalidTaskName { name: String },

    #[error("task '{name}' is declared more than once")]
    DuplicateTask { name: String },

    #[error("task '{task}' uses unknown operation '{operation}'")]
    UnknownOperation { task: String, operation: String },

    #[error("task '{task}' references unknown input '{input}'")]
    UnknownInput { task: String, input: String },

    #[error("task '{task}' lists itself as input")]
    SelfReference { task: String },

    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("task '{task}' has invalid options: {message}")]
    InvalidOptions { task: String, message: String },
}

/// Rejection of a whole submission, listing every violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphValidationError {
    pub violations: Vec<Violation>,
}

impl GraphValidationError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn has_cycle(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::Cycle { .. }))
    }
}

impl fmt::Display for GraphValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job graph rejected with {} violation(s)",
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphValidationError {}

/// Task names appear inside topic strings, so they are kept simple
pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}

/// Output of a successful validation
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    /// Edges point from a dependency to its dependent
    pub graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    names: Vec<String>,
    inputs: HashMap<String, Vec<InputRef>>,
    order: Vec<String>,
    externals: Vec<TaskId>,
}

impl ValidatedGraph {
    /// Task names in submission order
    pub fn task_names(&self) -> &[String] {
        &self.names
    }

    /// Resolved inputs of a task, in declared order
    pub fn inputs(&self, task: &str) -> &[InputRef] {
        self.inputs.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// In-job tasks consuming the given task's output
    pub fn dependents(&self, task: &str) -> Vec<String> {
        let Some(&idx) = self.indices.get(task) else {
            return Vec::new();
        };
        let mut dependents: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.sort_by_key(|name| self.position(name));
        dependents.dedup();
        dependents
    }

    /// Dependencies first; ties keep submission order
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Distinct external task ids referenced by the job
    pub fn external_refs(&self) -> &[TaskId] {
        &self.externals
    }

    fn position(&self, name: &str) -> usize {
        self.names
            .iter()
            .position(|n| n == name)
            .unwrap_or(usize::MAX)
    }
}

/// Checks a job submission against the registry and the known external tasks
pub struct GraphValidator<'a> {
    registry: &'a OperationRegistry,
    is_external: &'a dyn Fn(&str) -> bool,
}

impl<'a> GraphValidator<'a> {
    pub fn new(registry: &'a OperationRegistry, is_external: &'a dyn Fn(&str) -> bool) -> Self {
        Self {
            registry,
            is_external,
        }
    }

    pub fn validate(&self, spec: &JobSpec) -> Result<ValidatedGraph, GraphValidationError> {
        let mut violations = Vec::new();

        if spec.is_empty() {
            return Err(GraphValidationError::new(vec![Violation::EmptyJob]));
        }

        let mut graph = DiGraph::<String, ()>::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        let mut names = Vec::with_capacity(spec.len());

        for (name, _) in &spec.tasks {
            if !is_valid_task_name(name) {
                violations.push(Violation::InvalidTaskName { name: name.clone() });
            }
            if indices.contains_key(name) {
                violations.push(Violation::DuplicateTask { name: name.clone() });
                continue;
            }
            indices.insert(name.clone(), graph.add_node(name.clone()));
            names.push(name.clone());
        }

        let mut inputs: HashMap<String, Vec<InputRef>> = HashMap::new();
        let mut externals: Vec<TaskId> = Vec::new();

        for (name, task) in &spec.tasks {
            match self.registry.get(&task.operation) {
                None => violations.push(Violation::UnknownOperation {
                    task: name.clone(),
                    operation: task.operation.clone(),
                }),
                Some(handler) => {
                    if let Err(message) = handler.validate_options(task) {
                        violations.push(Violation::InvalidOptions {
                            task: name.clone(),
                            message,
                        });
                    }
                }
            }

            let mut resolved = Vec::new();
            let mut linked = HashSet::new();
            for input in task.input_names() {
                if input == name {
                    violations.push(Violation::SelfReference { task: name.clone() });
                    continue;
                }
                if let Some(&from) = indices.get(input) {
                    if linked.insert(input) {
                        graph.add_edge(from, indices[name.as_str()], ());
                    }
                    resolved.push(InputRef::Task(input.to_string()));
                } else if (self.is_external)(input) {
                    if !externals.iter().any(|e| e == input) {
                        externals.push(input.to_string());
                    }
                    resolved.push(InputRef::External(input.to_string()));
                } else {
                    violations.push(Violation::UnknownInput {
                        task: name.clone(),
                        input: input.to_string(),
                    });
                }
            }
            inputs.entry(name.clone()).or_insert(resolved);
        }

        for path in find_cycles(&graph, &names, &indices) {
            violations.push(Violation::Cycle { path });
        }

        if !violations.is_empty() {
            return Err(GraphValidationError::new(violations));
        }

        let order = topological_order(&graph, &names, &indices);
        Ok(ValidatedGraph {
            graph,
            indices,
            names,
            inputs,
            order,
            externals,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Depth-first search with visiting/visited markers. Every back edge closes
/// exactly one reported cycle.
fn find_cycles(
    graph: &DiGraph<String, ()>,
    names: &[String],
    indices: &HashMap<String, NodeIndex>,
) -> Vec<Vec<String>> {
    fn visit(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks[node.index()] = Mark::Visiting;
        stack.push(node);

        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort();
        next.dedup();

        for succ in next {
            match marks[succ.index()] {
                Mark::Unvisited => visit(graph, succ, marks, stack, cycles),
                Mark::Visiting => {
                    if let Some(start) = stack.iter().position(|n| *n == succ) {
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|n| graph[*n].clone()).collect();
                        path.push(graph[succ].clone());
                        cycles.push(path);
                    }
                }
                Mark::Visited => {}
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Visited;
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();
    let mut cycles = Vec::new();
    for name in names {
        let node = indices[name.as_str()];
        if marks[node.index()] == Mark::Unvisited {
            visit(graph, node, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

// Kahn's algorithm; among ready nodes the earliest submitted goes first
fn topological_order(
    graph: &DiGraph<String, ()>,
    names: &[String],
    indices: &HashMap<String, NodeIndex>,
) -> Vec<String> {
    let position: HashMap<NodeIndex, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (indices[name.as_str()], i))
        .collect();

    let mut remaining: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| {
            let distinct: HashSet<NodeIndex> =
                graph.neighbors_directed(n, Direction::Incoming).collect();
            (n, distinct.len())
        })
        .collect();

    let mut ready: BTreeSet<(usize, NodeIndex)> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(n, _)| (position[n], *n))
        .collect();

    let mut order = Vec::with_capacity(names.len());
    while let Some(entry) = ready.iter().next().copied() {
        ready.remove(&entry);
        let (_, node) = entry;
        order.push(graph[node].clone());

        let successors: HashSet<NodeIndex> =
            graph.neighbors_directed(node, Direction::Outgoing).collect();
        for succ in successors {
            if let Some(count) = remaining.get_mut(&succ) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((position[&succ], succ));
                }
            }
        }
    }
    order
}
