use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::graph::{FieldEdge, FieldGraph, TraversalState, Walk};
use crate::{
    error::CalcError,
    properties::{Field, FieldId},
};

/// One step of a calculation order: a field and the fields it is computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopoItem {
    pub id: FieldId,
    pub dependencies: Vec<FieldId>,
}

impl TopoItem {
    pub fn new<F: Into<FieldId>>(id: F, dependencies: Vec<FieldId>) -> Self {
        TopoItem {
            id: id.into(),
            dependencies,
        }
    }
}

/// Returns the first node found on a cycle, if any.
pub fn find_cycle(edges: &[FieldEdge]) -> Option<FieldId> {
    let graph = FieldGraph::from_edges(edges);
    let mut state = TraversalState::new(graph.node_count());
    let mut scratch = Vec::new();
    for idx in graph.nodes() {
        if let Err(culprit) = graph.post_order(idx, Direction::Outgoing, &mut state, &mut scratch) {
            return Some(graph.field_id(culprit).clone());
        }
    }
    None
}

pub fn has_cycle(edges: &[FieldEdge]) -> bool {
    find_cycle(edges).is_some()
}

/// Orders every field in `edges` so that each appears after all of its dependencies.
///
/// The walk starts from sinks (fields nothing else depends on) and visits producers first; any
/// remaining nodes are picked up afterwards. A cycle is a hard error.
pub fn topo_orders(edges: &[FieldEdge]) -> Result<Vec<TopoItem>, CalcError> {
    let graph = FieldGraph::from_edges(edges);
    let mut state = TraversalState::new(graph.node_count());
    let mut finished = Vec::with_capacity(graph.node_count());

    let roots: Vec<_> = graph.sinks().chain(graph.nodes()).collect();
    for root in roots {
        graph
            .post_order(root, Direction::Incoming, &mut state, &mut finished)
            .map_err(|culprit| {
                tracing::error!(
                    "[topo_orders] cycle through {}; refusing to order {} edges",
                    graph.field_id(culprit),
                    edges.len()
                );
                CalcError::cycle(graph.field_id(culprit))
            })?;
    }

    Ok(finished
        .into_iter()
        .map(|idx| TopoItem {
            id: graph.field_id(idx).clone(),
            dependencies: graph
                .neighbors(idx, Direction::Incoming)
                .into_iter()
                .map(|dep| graph.field_id(dep).clone())
                .collect(),
        })
        .collect())
}

/// Puts every start field missing from `orders` at the front, with no dependencies.
pub fn prepend_start_field_ids(orders: Vec<TopoItem>, start_ids: &[FieldId]) -> Vec<TopoItem> {
    let present: BTreeSet<&FieldId> = orders.iter().map(|item| &item.id).collect();
    let mut seen = BTreeSet::new();
    let mut out: Vec<TopoItem> = start_ids
        .iter()
        .filter(|id| !present.contains(id) && seen.insert(*id))
        .map(|id| TopoItem::new(id, vec![]))
        .collect();
    out.extend(orders);
    out
}

/// `start_id` followed by every field transitively computed from it, each after its producers.
pub fn topo_order_with_start(
    start_id: &FieldId,
    edges: &[FieldEdge],
) -> Result<Vec<FieldId>, CalcError> {
    let graph = FieldGraph::from_edges(edges);
    let Some(root) = graph.node_index(start_id) else {
        return Ok(vec![start_id.clone()]);
    };
    let mut state = TraversalState::new(graph.node_count());
    let mut finished = Vec::new();
    graph
        .post_order(root, Direction::Outgoing, &mut state, &mut finished)
        .map_err(|culprit| CalcError::cycle(graph.field_id(culprit)))?;
    Ok(finished
        .into_iter()
        .rev()
        .map(|idx| graph.field_id(idx).clone())
        .collect())
}

/// Shrinks an over-fetched edge set to the edges touching a field reachable from `seeds`.
///
/// Reachability follows edge direction (a seed reaches what is computed from it); an edge is kept
/// when either endpoint is reached. Output keeps input order, without duplicates.
pub fn filter_directed_graph(edges: &[FieldEdge], seeds: &[FieldId]) -> Vec<FieldEdge> {
    let graph = FieldGraph::from_edges(edges);
    let reached: BTreeSet<&FieldId> = graph
        .reachable(seeds, Walk::Directed(Direction::Outgoing))
        .into_iter()
        .map(|idx| graph.field_id(idx))
        .collect();
    let mut seen = BTreeSet::new();
    edges
        .iter()
        .filter(|edge| {
            (reached.contains(&edge.from_field_id) || reached.contains(&edge.to_field_id))
                && seen.insert(*edge)
        })
        .cloned()
        .collect()
}

/// Edges of the weakly connected component containing `node_id`.
pub fn prune_graph(node_id: &FieldId, edges: &[FieldEdge]) -> Vec<FieldEdge> {
    let graph = FieldGraph::from_edges(edges);
    let component: BTreeSet<&FieldId> = graph
        .reachable([node_id], Walk::Weak)
        .into_iter()
        .map(|idx| graph.field_id(idx))
        .collect();
    edges
        .iter()
        .filter(|edge| {
            component.contains(&edge.from_field_id) || component.contains(&edge.to_field_id)
        })
        .cloned()
        .collect()
}

/// Dependency edges implied by field definitions.
pub fn derive_edges<'a, I>(fields: I) -> Vec<FieldEdge>
where
    I: IntoIterator<Item = &'a Field>,
{
    fields
        .into_iter()
        .flat_map(|field| {
            field
                .dependency_field_ids()
                .into_iter()
                .map(move |dep| FieldEdge::new(dep, &field.id))
        })
        .collect()
}
