//! # recalc-core
//!
//! Incremental recalculation for relational spreadsheet databases.
//!
//! ## Overview
//!
//! Tables hold records; fields hold cells. Computed fields (formulas, lookups, rollups, links,
//! system fields) derive their values from other fields, possibly across tables through links.
//! When some cells change, recalc-core finds every computed cell that depends on them, puts the
//! affected fields in dependency order, recomputes exactly the affected records and reports the
//! cells whose value actually changed.
//!
//! ## Architecture
//!
//! - **[`topo`]**: Pure graph algorithms over field dependency edges: ordering, cycle detection,
//!   pruning and directed reachability
//! - **[`store`]**: Loads the dependency subgraph and metadata a pass needs ([`store::GraphAccessor`])
//! - **[`resolve`]**: Maps changed records of one field onto the records of a dependent field,
//!   through foreign-key hosts, pending link edits and lookup filters
//! - **[`calc`]**: Computes one cell from its record and the linked foreign records
//! - **[`engine`]**: Orchestrates a pass ([`engine::ReferenceEngine`])
//! - **[`changes`]**: Merges per-cell changes into the result of a pass
//! - **[`query`]**: The traits the engine consumes: [`query::CalcSource`] and [`query::Evaluator`]
//! - **[`memory`]**: An in-process [`query::CalcSource`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use recalc_core::{
//!     config::CalcConfig,
//!     engine::{CalcRequest, CalcSeed, ReferenceEngine},
//!     memory::MemoryStore,
//!     query::Evaluator,
//! };
//! # use recalc_core::{properties::{CellValue, FieldMap, Record}, CalcError};
//! # struct NoFormulas;
//! # impl Evaluator for NoFormulas {
//! #     fn evaluate(&self, _: &str, _: &FieldMap, _: &Record, _: Option<&str>)
//! #         -> Result<Option<CellValue>, CalcError> { Ok(None) }
//! # }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     // ... add tables, fields and records, then edit some cells ...
//!     let mut engine = ReferenceEngine::new(store, NoFormulas, CalcConfig::default());
//!     let report = engine
//!         .calculate(CalcRequest::new(vec![CalcSeed::new("fldPrice", ["rec1"])]))
//!         .await?;
//!     engine.source_mut().apply(&report.change_set());
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **default**: Engine, in-memory store
//! - **service**: SQLite-backed [`query::CalcSource`] in `db` (`sqlx`)

pub mod calc;
pub mod changes;
pub mod config;
#[cfg(feature = "service")]
pub mod db;
pub mod engine;
pub mod error;
pub mod filter;
pub mod memory;
pub mod properties;
pub mod query;
pub mod resolve;
pub mod store;
#[cfg(test)]
mod tests;
pub mod topo;

pub use error::*;
