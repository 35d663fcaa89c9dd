//! Pipeline DAG validation.
//!
//! Verifies a submitted pipeline `definition` is acyclic and
//! dependency-closed before it is ever persisted, using Kahn's algorithm
//! for deterministic cycle detection and error reporting.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single task entry in a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque identifier for the task body the worker will execute.
    /// Orthogonal to scheduling; never interpreted here.
    pub function: String,
    /// Task identifiers this task depends on, in no particular order.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A pipeline definition: a mapping from task identifier to its spec.
/// `BTreeMap` keeps iteration order deterministic, which the validator
/// relies on for reproducible error messages.
pub type PipelineDefinition = BTreeMap<String, TaskSpec>;

/// Errors produced by [`validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("task {task:?} declares unknown dependency {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("pipeline definition contains a cycle involving: {tasks:?}")]
    Cycle { tasks: Vec<String> },

    #[error("pipeline definition has no tasks")]
    NoTasks,
}

/// Validate that a pipeline definition is acyclic and every dependency
/// names a task that exists in the definition.
///
/// Algorithm: compute in-degrees from the dependency lists; seed a queue
/// with every task whose in-degree is zero; repeatedly pop and decrement
/// the in-degree of each task that declares the popped one as a
/// dependency. Success iff the number popped equals the number of tasks.
/// O(V+E), deterministic, and pure -- no broker or store calls.
pub fn validate(definition: &PipelineDefinition) -> Result<(), DagError> {
    if definition.is_empty() {
        return Err(DagError::NoTasks);
    }

    for (task, spec) in definition {
        for dep in &spec.dependencies {
            if !definition.contains_key(dep) {
                return Err(DagError::UnknownDependency {
                    task: task.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(definition)
}

/// Kahn's algorithm cycle check. Assumes every dependency has already been
/// confirmed to reference a task that exists.
fn check_for_cycles(definition: &PipelineDefinition) -> Result<(), DagError> {
    let mut in_degree: HashMap<&str, usize> = definition
        .keys()
        .map(|task| (task.as_str(), 0usize))
        .collect();

    // Adjacency: task -> tasks that depend on it (its children).
    let mut children: HashMap<&str, Vec<&str>> = definition
        .keys()
        .map(|task| (task.as_str(), Vec::new()))
        .collect();

    for (task, spec) in definition {
        *in_degree.get_mut(task.as_str()).unwrap() = spec.dependencies.len();
        for dep in &spec.dependencies {
            children.get_mut(dep.as_str()).unwrap().push(task.as_str());
        }
    }

    // Deterministic processing order.
    let mut roots: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(task, _)| *task)
        .collect();
    roots.sort_unstable();
    let mut queue: VecDeque<&str> = roots.into_iter().collect();

    let mut sorted_count = 0usize;
    while let Some(task) = queue.pop_front() {
        sorted_count += 1;
        for &child in &children[task] {
            let degree = in_degree.get_mut(child).unwrap();
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(child);
            }
        }
    }

    if sorted_count != definition.len() {
        let mut stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(task, _)| task.to_string())
            .collect();
        stuck.sort();
        return Err(DagError::Cycle { tasks: stuck });
    }

    Ok(())
}

/// Compute the reverse adjacency graph: for every task, the ordered
/// sequence of tasks that directly depend on it (its children).
///
/// Read-only after bootstrap; the run bootstrapper calls this once to
/// seed the broker's `reverse_graph` map.
pub fn reverse_graph(definition: &PipelineDefinition) -> BTreeMap<String, Vec<String>> {
    let mut graph: BTreeMap<String, Vec<String>> =
        definition.keys().map(|task| (task.clone(), Vec::new())).collect();

    for (task, spec) in definition {
        for dep in &spec.dependencies {
            graph.get_mut(dep).unwrap().push(task.clone());
        }
    }

    graph
}

/// The tasks with no dependencies -- the roots enqueued at bootstrap time.
pub fn roots(definition: &PipelineDefinition) -> Vec<String> {
    definition
        .iter()
        .filter(|(_, spec)| spec.dependencies.is_empty())
        .map(|(task, _)| task.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(deps: &[&str]) -> TaskSpec {
        TaskSpec {
            function: "noop".to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn rejects_empty_definition() {
        let def = PipelineDefinition::new();
        assert_eq!(validate(&def), Err(DagError::NoTasks));
    }

    #[test]
    fn accepts_linear_three() {
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&[]));
        def.insert("b".into(), spec(&["a"]));
        def.insert("c".into(), spec(&["b"]));
        assert!(validate(&def).is_ok());
        assert_eq!(roots(&def), vec!["a".to_string()]);
    }

    #[test]
    fn accepts_diamond() {
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&[]));
        def.insert("b".into(), spec(&["a"]));
        def.insert("c".into(), spec(&["a"]));
        def.insert("d".into(), spec(&["b", "c"]));
        assert!(validate(&def).is_ok());

        let graph = reverse_graph(&def);
        let mut a_children = graph["a"].clone();
        a_children.sort();
        assert_eq!(a_children, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(graph["b"], vec!["d".to_string()]);
        assert_eq!(graph["c"], vec!["d".to_string()]);
    }

    #[test]
    fn rejects_direct_cycle() {
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&["b"]));
        def.insert("b".into(), spec(&["a"]));
        let err = validate(&def).unwrap_err();
        match err {
            DagError::Cycle { tasks } => {
                assert_eq!(tasks, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_transitive_cycle() {
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&["c"]));
        def.insert("b".into(), spec(&["a"]));
        def.insert("c".into(), spec(&["b"]));
        assert!(matches!(validate(&def), Err(DagError::Cycle { .. })));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&["x"]));
        assert_eq!(
            validate(&def),
            Err(DagError::UnknownDependency {
                task: "a".to_string(),
                dependency: "x".to_string(),
            })
        );
    }

    #[test]
    fn degenerate_cycle_with_no_roots_is_rejected() {
        // Every task has a dependency, none has in-degree zero.
        let mut def = PipelineDefinition::new();
        def.insert("a".into(), spec(&["a"]));
        assert!(matches!(validate(&def), Err(DagError::Cycle { .. })));
    }
}
