//! Runtime task graph of one execution.
//!
//! Holds one [`TaskNode`] per task instance: the top-level steps created
//! eagerly at execution start, plus nested tasks appended when a composite
//! task expands. Readiness is a pure function of node statuses, so
//! re-evaluating it after any single transition is safe and never
//! re-selects a task that is already `Running`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use stepflow_types::execution::{TaskExecution, TaskStatus};
use stepflow_types::workflow::StepDefinition;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::ExecutionScope;
use super::kinds::ChildGroup;

/// One task instance plus its position in the graph.
#[derive(Debug)]
pub struct TaskNode {
    pub record: TaskExecution,
    pub step: Arc<StepDefinition>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Sibling tasks this task depends on.
    pub deps: Vec<usize>,
    /// Loop variables visible to this task (inherited from enclosing loops).
    pub bindings: Map<String, Value>,
    /// Cap on concurrently running children.
    pub child_cap: Option<u32>,
    /// Nested tasks have been instantiated; the task settles with them.
    pub expanded: bool,
    /// Failed, but treated as satisfied by the `Ignore` error handler.
    pub ignored: bool,
    /// Waiting for an approval/rejection signal.
    pub awaiting_signal: bool,
    /// Bumped on every dispatch/timer so stale completions can be dropped.
    pub token: u64,
    /// Cancels the in-flight attempt.
    pub cancel: Option<CancellationToken>,
}

impl TaskNode {
    fn new(
        execution_id: Uuid,
        task_id: String,
        step: &StepDefinition,
        parent: Option<(usize, String)>,
        iteration: Option<u32>,
        status: TaskStatus,
    ) -> Self {
        let (parent, parent_task_id) = match parent {
            Some((idx, id)) => (Some(idx), Some(id)),
            None => (None, None),
        };
        Self {
            record: TaskExecution {
                execution_id,
                task_id,
                step_id: step.id.clone(),
                parent_task_id,
                iteration,
                kind: step.kind(),
                status,
                input: None,
                output: None,
                error: None,
                retry_count: 0,
                started_at: None,
                completed_at: (status == TaskStatus::Skipped).then(Utc::now),
            },
            step: Arc::new(step.clone()),
            parent,
            children: Vec::new(),
            deps: Vec::new(),
            bindings: Map::new(),
            child_cap: None,
            expanded: false,
            ignored: false,
            awaiting_signal: false,
            token: 0,
            cancel: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.record.status
    }

    pub fn task_id(&self) -> &str {
        &self.record.task_id
    }
}

#[derive(Debug)]
pub struct TaskGraph {
    execution_id: Uuid,
    nodes: Vec<TaskNode>,
    roots: Vec<usize>,
    by_id: HashMap<String, usize>,
}

impl TaskGraph {
    /// Create one `Pending` task per top-level step.
    pub fn new(execution_id: Uuid, steps: &[StepDefinition]) -> Self {
        let mut graph = Self {
            execution_id,
            nodes: Vec::new(),
            roots: Vec::new(),
            by_id: HashMap::new(),
        };
        let roots = graph.add_group(None, &ChildGroup::runnable(steps.to_vec()));
        graph.roots = roots;
        graph
    }

    /// Mark a top-level task as already completed, copying the output and
    /// timestamps of a task from an earlier execution.
    pub fn seed_completed(&mut self, previous: &TaskExecution) -> bool {
        let Some(&idx) = self.by_id.get(&previous.task_id) else {
            return false;
        };
        if self.nodes[idx].parent.is_some() {
            return false;
        }
        let record = &mut self.nodes[idx].record;
        record.status = TaskStatus::Completed;
        record.input = previous.input.clone();
        record.output = previous.output.clone();
        record.started_at = previous.started_at;
        record.completed_at = previous.completed_at;
        true
    }

    /// Instantiate nested tasks under `parent`. Returns the new indices.
    pub fn expand(&mut self, parent: usize, groups: &[ChildGroup], cap: Option<u32>) -> Vec<usize> {
        self.nodes[parent].expanded = true;
        self.nodes[parent].child_cap = cap;
        let mut added = Vec::new();
        for group in groups {
            added.extend(self.add_group(Some(parent), group));
        }
        self.nodes[parent].children.extend(added.iter().copied());
        added
    }

    fn add_group(&mut self, parent: Option<usize>, group: &ChildGroup) -> Vec<usize> {
        let status = if group.skipped {
            TaskStatus::Skipped
        } else {
            TaskStatus::Pending
        };
        let mut bindings = parent
            .map(|p| self.nodes[p].bindings.clone())
            .unwrap_or_default();
        bindings.extend(group.bindings.clone());

        let mut local: HashMap<&str, usize> = HashMap::new();
        let mut added = Vec::with_capacity(group.steps.len());
        for step in &group.steps {
            let task_id = match parent {
                None => step.id.clone(),
                Some(p) => {
                    let prefix = self.nodes[p].task_id();
                    match group.iteration {
                        Some(i) => format!("{prefix}[{i}]/{}", step.id),
                        None => format!("{prefix}/{}", step.id),
                    }
                }
            };
            let parent_ref = parent.map(|p| (p, self.nodes[p].task_id().to_string()));
            let mut node = TaskNode::new(
                self.execution_id,
                task_id.clone(),
                step,
                parent_ref,
                group.iteration,
                status,
            );
            node.bindings = bindings.clone();
            let idx = self.nodes.len();
            self.nodes.push(node);
            self.by_id.insert(task_id, idx);
            local.insert(step.id.as_str(), idx);
            added.push(idx);
        }

        for (step, &idx) in group.steps.iter().zip(added.iter()) {
            let deps = step
                .depends_on
                .iter()
                .filter_map(|d| local.get(d.as_str()).copied())
                .collect();
            self.nodes[idx].deps = deps;
        }
        added
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &TaskNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut TaskNode {
        &mut self.nodes[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (usize, &TaskNode)> {
        self.nodes.iter().enumerate()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn find(&self, task_id: &str) -> Option<usize> {
        self.by_id.get(task_id).copied()
    }

    pub fn snapshot(&self) -> Vec<TaskExecution> {
        self.nodes.iter().map(|n| n.record.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Completed, Skipped, or a failure the error handler chose to ignore.
    pub fn is_satisfied(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        match node.status() {
            TaskStatus::Completed | TaskStatus::Skipped => true,
            TaskStatus::Failed => node.ignored,
            _ => false,
        }
    }

    fn deps_satisfied(&self, idx: usize) -> bool {
        self.nodes[idx].deps.iter().all(|&d| self.is_satisfied(d))
    }

    /// Id of a terminal, unsatisfied task this task (transitively) waits on.
    pub fn blocking_dependency(&self, idx: usize) -> Option<&str> {
        let mut stack = self.nodes[idx].deps.clone();
        while let Some(dep) = stack.pop() {
            let node = &self.nodes[dep];
            if node.status().is_terminal() && !self.is_satisfied(dep) {
                return Some(node.task_id());
            }
            if node.status() == TaskStatus::Pending {
                stack.extend(node.deps.iter().copied());
            }
        }
        None
    }

    fn running_children(&self, parent: usize) -> usize {
        self.nodes[parent]
            .children
            .iter()
            .filter(|&&c| self.nodes[c].status() == TaskStatus::Running)
            .count()
    }

    /// Tasks that may transition to `Running` now, in creation order.
    ///
    /// A task is ready when it is `Pending`, its parent (if any) is a
    /// `Running` composite, every dependency is satisfied, and the parent's
    /// concurrency cap leaves room.
    pub fn ready(&self) -> Vec<usize> {
        let mut budget: HashMap<usize, usize> = HashMap::new();
        let mut ready = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.status() != TaskStatus::Pending || !self.deps_satisfied(idx) {
                continue;
            }
            match node.parent {
                None => ready.push(idx),
                Some(p) => {
                    let parent = &self.nodes[p];
                    if parent.status() != TaskStatus::Running || !parent.expanded {
                        continue;
                    }
                    let remaining = budget.entry(p).or_insert_with(|| match parent.child_cap {
                        Some(cap) => (cap as usize).saturating_sub(self.running_children(p)),
                        None => usize::MAX,
                    });
                    if *remaining > 0 {
                        *remaining -= 1;
                        ready.push(idx);
                    }
                }
            }
        }
        ready
    }

    /// A running composite whose nested tasks can make no further progress:
    /// none is `Running` and none is eligible to start.
    pub fn is_settled(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        node.expanded
            && node.status() == TaskStatus::Running
            && node.children.iter().all(|&c| match self.nodes[c].status() {
                TaskStatus::Running => false,
                TaskStatus::Pending => !self.deps_satisfied(c),
                _ => true,
            })
    }

    pub fn settled_composites(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| self.is_settled(i)).collect()
    }

    /// First nested task that failed without being ignored, if any.
    pub fn failed_child(&self, parent: usize) -> Option<usize> {
        self.nodes[parent].children.iter().copied().find(|&c| {
            let status = self.nodes[c].status();
            !self.is_satisfied(c) && status != TaskStatus::Pending
        })
    }

    pub fn children_satisfied(&self, parent: usize) -> bool {
        self.nodes[parent]
            .children
            .iter()
            .all(|&c| self.is_satisfied(c))
    }

    pub fn any_running(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.status() == TaskStatus::Running)
    }

    pub fn roots_satisfied(&self) -> bool {
        self.roots.iter().all(|&r| self.is_satisfied(r))
    }

    // -----------------------------------------------------------------------
    // Scope
    // -----------------------------------------------------------------------

    /// Tasks in the same step list as `idx` (same parent and iteration).
    fn sibling_group(&self, idx: usize) -> Vec<usize> {
        let node = &self.nodes[idx];
        match node.parent {
            None => self.roots.clone(),
            Some(p) => self.nodes[p]
                .children
                .iter()
                .copied()
                .filter(|&c| self.nodes[c].record.iteration == node.record.iteration)
                .collect(),
        }
    }

    /// Build the evaluation scope of a task: outputs of its own step list and
    /// of every enclosing list (inner lists win), plus its loop bindings.
    pub fn scope_for(&self, idx: usize, base: &ExecutionScope) -> ExecutionScope {
        let mut chain = vec![idx];
        let mut cursor = self.nodes[idx].parent;
        while let Some(p) = cursor {
            chain.push(p);
            cursor = self.nodes[p].parent;
        }

        let mut scope = base.clone();
        for &level in chain.iter().rev() {
            for sibling in self.sibling_group(level) {
                let node = &self.nodes[sibling];
                if node.status().is_terminal() {
                    scope.record_step(&node.record.step_id, node.status(), node.record.output.as_ref());
                }
            }
        }
        for (name, value) in &self.nodes[idx].bindings {
            scope.bind(name, value.clone());
        }
        scope
    }

    /// Scope with every terminal task of the execution visible.
    pub fn full_scope(&self, base: &ExecutionScope) -> ExecutionScope {
        let mut scope = base.clone();
        for node in &self.nodes {
            if node.status().is_terminal() {
                scope.record_step(&node.record.step_id, node.status(), node.record.output.as_ref());
            }
        }
        scope
    }
}
