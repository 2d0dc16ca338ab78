//! C3 — dependency resolution and leveling.
//!
//! Takes a [`ProcessTree`] and computes an execution plan: an ordered list
//! of *levels*, each a set of step ids with no dependency on any step in a
//! later level, such that every step in a level depends only on steps in
//! strictly earlier levels (Kahn's algorithm, same shape as the graph
//! validation/topological-sort passes the teacher crate performs before
//! compiling a `StateGraph`). Also performs the structural checks the
//! teacher's graph-validation pass does: unreachable steps, steps with no
//! path to completion, and cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{BuildError, Result};
use crate::types::{ProcessTree, StepId};

/// A computed execution plan: step ids grouped into dependency levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLevels {
    levels: Vec<Vec<StepId>>,
}

impl ExecutionLevels {
    /// The levels, in execution order. Every step in `levels[i]` depends
    /// only on steps in `levels[0..i]`.
    pub fn levels(&self) -> &[Vec<StepId>] {
        &self.levels
    }

    /// Total number of steps across all levels.
    pub fn step_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// The 0-based level index a step was assigned to, if it is part of
    /// this plan.
    pub fn level_of(&self, step: StepId) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.contains(&step))
    }
}

/// A non-fatal structural warning surfaced alongside a valid leveling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// A step can never run because one of its non-optional dependencies
    /// is unreachable from any root.
    Unreachable(StepId),
    /// A step has no outgoing edge and is not a [`crate::types::StepType::FinalAnswer`]
    /// or [`crate::types::StepType::Presentation`] step — likely a dead end
    /// left over from an incomplete template.
    DeadEnd(StepId),
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::Unreachable(id) => {
                write!(f, "step {id} is unreachable from any root")
            }
            ValidationWarning::DeadEnd(id) => {
                write!(f, "step {id} has no dependents and is not a terminal step")
            }
        }
    }
}

/// Resolves a [`ProcessTree`] into an [`ExecutionLevels`] plan, detecting
/// cycles and surfacing structural warnings along the way.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Construct a resolver. Stateless today; a struct so call sites read
    /// the same way as the other `Cx` components.
    pub fn new() -> Self {
        Self
    }

    /// Compute the execution levels for a tree.
    ///
    /// # Errors
    /// [`BuildError::CycleDetected`] if the tree's dependency edges contain
    /// a cycle — this should not happen for trees produced by
    /// [`crate::process::ProcessBuilder`], which checks for cycles at
    /// construction time, but a tree may also arrive from a restored
    /// checkpoint or be constructed by hand, so the check is repeated here.
    pub fn resolve(&self, tree: &ProcessTree) -> Result<(ExecutionLevels, Vec<ValidationWarning>)> {
        let (graph, index_of) = build_graph(tree);

        if petgraph::algo::is_cyclic_directed(&graph) {
            let cycle = find_a_cycle(&graph, &index_of);
            return Err(BuildError::CycleDetected(cycle).into());
        }

        let levels = kahn_levels(&graph, &index_of, tree);
        let warnings = validate(tree, &graph, &index_of);

        Ok((ExecutionLevels { levels }, warnings))
    }
}

fn build_graph(tree: &ProcessTree) -> (DiGraph<StepId, ()>, BTreeMap<StepId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut index_of = BTreeMap::new();
    for id in tree.steps.keys() {
        index_of.insert(*id, graph.add_node(*id));
    }
    for step in tree.steps.values() {
        for dep in &step.depends_on {
            if let (Some(&from), Some(&to)) = (index_of.get(dep), index_of.get(&step.id)) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, index_of)
}

fn find_a_cycle(
    graph: &DiGraph<StepId, ()>,
    index_of: &BTreeMap<StepId, NodeIndex>,
) -> Vec<StepId> {
    // petgraph's is_cyclic_directed only tells us a cycle exists; walk a
    // DFS to recover one concrete cycle for the error message.
    let id_of: BTreeMap<NodeIndex, StepId> = index_of.iter().map(|(id, idx)| (*idx, *id)).collect();
    for start in graph.node_indices() {
        let mut stack = vec![(start, vec![start])];
        let mut visited_global = BTreeSet::new();
        while let Some((node, path)) = stack.pop() {
            if !visited_global.insert(node) {
                continue;
            }
            for edge in graph.edges(node) {
                let next = edge.target();
                if next == start && path.len() > 1 {
                    return path.iter().map(|idx| id_of[idx]).collect();
                }
                if !path.contains(&next) {
                    let mut extended = path.clone();
                    extended.push(next);
                    stack.push((next, extended));
                }
            }
        }
    }
    Vec::new()
}

fn kahn_levels(
    graph: &DiGraph<StepId, ()>,
    index_of: &BTreeMap<StepId, NodeIndex>,
    tree: &ProcessTree,
) -> Vec<Vec<StepId>> {
    let id_of: BTreeMap<NodeIndex, StepId> = index_of.iter().map(|(id, idx)| (*idx, *id)).collect();

    let mut in_degree: BTreeMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.edges_directed(n, Direction::Incoming).count()))
        .collect();

    let mut frontier: VecDeque<NodeIndex> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut levels = Vec::new();
    let mut remaining = in_degree.len();

    while !frontier.is_empty() {
        let mut current_ids: Vec<StepId> = frontier.iter().map(|n| id_of[n]).collect();
        current_ids.sort_by_key(|id| tree.step(*id).map(|s| s.name.clone()).unwrap_or_default());

        let mut next_frontier = VecDeque::new();
        for node in frontier.drain(..) {
            remaining -= 1;
            for edge in graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target();
                let deg = in_degree.get_mut(&target).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    next_frontier.push_back(target);
                }
            }
        }

        levels.push(current_ids);
        frontier = next_frontier;
    }

    debug_assert_eq!(remaining, 0, "acyclic graph must fully drain");
    levels
}

fn validate(
    tree: &ProcessTree,
    graph: &DiGraph<StepId, ()>,
    index_of: &BTreeMap<StepId, NodeIndex>,
) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    let mut reachable = BTreeSet::new();
    let mut queue: VecDeque<StepId> = tree.roots.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(step) = tree.step(id) {
            for edge in graph.edges(index_of[&id]) {
                let target_id = graph[edge.target()];
                if tree.steps.contains_key(&target_id) {
                    queue.push_back(target_id);
                }
            }
            let _ = step;
        }
    }
    for id in tree.steps.keys() {
        if !reachable.contains(id) {
            warnings.push(ValidationWarning::Unreachable(*id));
        }
    }

    for (id, step) in &tree.steps {
        let is_terminal = matches!(
            step.step_type,
            crate::types::StepType::FinalAnswer | crate::types::StepType::Presentation
        );
        let has_dependents = graph
            .edges_directed(index_of[id], Direction::Outgoing)
            .next()
            .is_some();
        if !is_terminal && !has_dependents {
            warnings.push(ValidationWarning::DeadEnd(*id));
        }
    }

    warnings
}
