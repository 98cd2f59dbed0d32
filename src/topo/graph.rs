//! Arena-indexed field graph.
//!
//! [`FieldGraph`] wraps a [`petgraph::Graph`] whose node indices follow the order in which field
//! ids first appear in the edge list. All traversals use explicit work stacks so that recursion
//! depth never depends on the size of the schema.

use petgraph::{graph::NodeIndex, Directed, Direction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::properties::FieldId;

/// `to_field_id`'s value is computed from `from_field_id`'s value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEdge {
    pub from_field_id: FieldId,
    pub to_field_id: FieldId,
}

impl FieldEdge {
    pub fn new<F: Into<FieldId>, T: Into<FieldId>>(from: F, to: T) -> Self {
        FieldEdge {
            from_field_id: from.into(),
            to_field_id: to.into(),
        }
    }
}

impl<F: Into<FieldId>, T: Into<FieldId>> From<(F, T)> for FieldEdge {
    fn from((from, to): (F, T)) -> Self {
        FieldEdge::new(from, to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Per-node visit marks, threaded explicitly through every traversal.
#[derive(Debug, Clone)]
pub(crate) struct TraversalState {
    marks: Vec<Mark>,
}

impl TraversalState {
    pub(crate) fn new(node_count: usize) -> Self {
        TraversalState {
            marks: vec![Mark::Unvisited; node_count],
        }
    }

    pub(crate) fn mark(&self, idx: NodeIndex) -> Mark {
        self.marks[idx.index()]
    }

    fn set(&mut self, idx: NodeIndex, mark: Mark) {
        self.marks[idx.index()] = mark;
    }
}

/// Which edges a reachability walk may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    Directed(Direction),
    Weak,
}

struct Frame {
    node: NodeIndex,
    neighbors: Vec<NodeIndex>,
    cursor: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FieldGraph {
    graph: petgraph::Graph<FieldId, (), Directed>,
    index: BTreeMap<FieldId, NodeIndex>,
}

impl FieldGraph {
    /// Builds the graph, collapsing duplicate edges.
    pub fn from_edges<'a, I>(edges: I) -> Self
    where
        I: IntoIterator<Item = &'a FieldEdge>,
    {
        let mut out = FieldGraph::default();
        let mut seen = BTreeSet::new();
        for edge in edges {
            let source = out.add_node(&edge.from_field_id);
            let sink = out.add_node(&edge.to_field_id);
            if seen.insert((source, sink)) {
                out.graph.add_edge(source, sink, ());
            }
        }
        out
    }

    fn add_node(&mut self, id: &FieldId) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        idx
    }

    pub fn as_graph(&self) -> &petgraph::Graph<FieldId, (), Directed> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, id: &FieldId) -> bool {
        self.index.contains_key(id)
    }

    pub(crate) fn node_index(&self, id: &FieldId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub(crate) fn field_id(&self, idx: NodeIndex) -> &FieldId {
        &self.graph[idx]
    }

    /// Nodes in first-appearance order.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Nodes without outgoing edges.
    pub(crate) fn sinks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices().filter(|idx| {
            self.graph
                .neighbors_directed(*idx, Direction::Outgoing)
                .next()
                .is_none()
        })
    }

    /// Neighbors in edge insertion order (petgraph yields the most recent edge first).
    pub(crate) fn neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, direction).collect();
        neighbors.reverse();
        neighbors
    }

    /// Post-order depth-first walk from `root` along `direction`, appending finished nodes to
    /// `out`. Marks in `state` persist across calls so several roots can share one walk.
    ///
    /// Returns `Err(node)` when `node` is re-entered while still on the stack, i.e. the walk found
    /// a cycle (self-loops included).
    pub(crate) fn post_order(
        &self,
        root: NodeIndex,
        direction: Direction,
        state: &mut TraversalState,
        out: &mut Vec<NodeIndex>,
    ) -> Result<(), NodeIndex> {
        match state.mark(root) {
            Mark::Visited => return Ok(()),
            Mark::Visiting => return Err(root),
            Mark::Unvisited => {}
        }
        state.set(root, Mark::Visiting);
        let mut stack = vec![Frame {
            node: root,
            neighbors: self.neighbors(root, direction),
            cursor: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if let Some(&next) = frame.neighbors.get(frame.cursor) {
                frame.cursor += 1;
                match state.mark(next) {
                    Mark::Visiting => return Err(next),
                    Mark::Visited => {}
                    Mark::Unvisited => {
                        state.set(next, Mark::Visiting);
                        stack.push(Frame {
                            node: next,
                            neighbors: self.neighbors(next, direction),
                            cursor: 0,
                        });
                    }
                }
            } else {
                let node = frame.node;
                stack.pop();
                state.set(node, Mark::Visited);
                out.push(node);
            }
        }
        Ok(())
    }

    /// Every node reachable from `seeds` (seeds included). Seeds absent from the graph are
    /// ignored.
    pub(crate) fn reachable<'a, I>(&self, seeds: I, walk: Walk) -> BTreeSet<NodeIndex>
    where
        I: IntoIterator<Item = &'a FieldId>,
    {
        let mut found = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = seeds
            .into_iter()
            .filter_map(|id| self.node_index(id))
            .collect();
        while let Some(idx) = stack.pop() {
            if !found.insert(idx) {
                continue;
            }
            let neighbors: Vec<NodeIndex> = match walk {
                Walk::Directed(direction) => {
                    self.graph.neighbors_directed(idx, direction).collect()
                }
                Walk::Weak => self.graph.neighbors_undirected(idx).collect(),
            };
            stack.extend(neighbors.into_iter().filter(|n| !found.contains(n)));
        }
        found
    }
}
