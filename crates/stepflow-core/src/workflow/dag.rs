//! Dependency graph algorithms over sibling step lists.
//!
//! - [`find_cycle`]: depth-first search with a recursion stack; a back-edge
//!   to a node still on the stack is a cycle, reported as the path of step ids.
//! - [`downstream_closure`]: every step that transitively depends on a step.
//! - [`reverse_dependency_order`]: `petgraph` topological sort, reversed,
//!   used to order compensations.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stepflow_types::workflow::StepDefinition;

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Find a dependency cycle among sibling steps.
///
/// Returns the cycle as a path that starts and ends with the same step id
/// (e.g. `["a", "c", "b", "a"]`), or `None` if the list is acyclic.
/// Dependencies naming unknown steps are ignored here.
pub fn find_cycle(steps: &[StepDefinition]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut stack: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        steps: &[StepDefinition],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for dep in &steps[node].depends_on {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|&n| steps[n].id.clone()).collect();
                    path.push(steps[next].id.clone());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, steps, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    for node in 0..steps.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, steps, &index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Closures
// ---------------------------------------------------------------------------

/// Returns `step_id` plus every sibling that transitively depends on it.
pub fn downstream_closure(step_id: &str, steps: &[StepDefinition]) -> HashSet<String> {
    let mut result = HashSet::new();
    if !steps.iter().any(|s| s.id == step_id) {
        return result;
    }
    result.insert(step_id.to_string());
    let mut changed = true;
    while changed {
        changed = false;
        for step in steps {
            if !result.contains(&step.id) && step.depends_on.iter().any(|d| result.contains(d)) {
                result.insert(step.id.clone());
                changed = true;
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Order nodes so that every node comes before the nodes it depends on.
///
/// `nodes` pairs each id with the ids it depends on; dependencies outside the
/// set are ignored. Independent nodes keep a stable order. If the input
/// unexpectedly contains a cycle, the input order reversed is returned.
pub fn reverse_dependency_order(nodes: &[(String, Vec<String>)]) -> Vec<String> {
    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    for (to, (_, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            if let Some(&from) = position.get(dep.as_str()) {
                graph.add_edge(node_indices[from], node_indices[to], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(sorted) => sorted
            .into_iter()
            .rev()
            .map(|n| nodes[graph[n]].0.clone())
            .collect(),
        Err(_) => nodes.iter().rev().map(|(id, _)| id.clone()).collect(),
    }
}
