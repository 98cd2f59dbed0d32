//! Topology engine: pure graph algorithms over field dependency edges.
//!
//! Nothing in here performs I/O. Every function takes an edge list and returns a fresh result;
//! traversal state lives on the call stack of the function that owns it.
//!
//! # Module Organization
//!
//! - [`graph`]: [`FieldEdge`] and the arena-indexed [`FieldGraph`] with the shared iterative
//!   depth-first walk that every cycle check goes through
//! - [`order`]: ordering, pruning and filtering operations used by the calculation engine

mod graph;
mod order;


pub use graph::{FieldEdge, FieldGraph};
pub use order::{
    derive_edges, filter_directed_graph, find_cycle, has_cycle, prepend_start_field_ids,
    prune_graph, topo_order_with_start, topo_orders, TopoItem,
};
