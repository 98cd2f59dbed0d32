//! Interfaces the calculation engine consumes from its collaborators.
//!
//! - [`CalcSource`]: the persistence/query layer (edges, metadata, records, foreign-key hosts)
//! - [`Evaluator`]: the formula expression library
//!
//! [`crate::memory::MemoryStore`] and (with the `service` feature) [`crate::db::DbConnection`]
//! implement [`CalcSource`].

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future};

use crate::{
    error::CalcError,
    properties::{CellValue, Field, FieldId, FieldMap, Record, RecordId, TableId},
    topo::FieldEdge,
};

pub const DEFAULT_PAGE_SIZE: usize = 5000;

/// Physical location of a link's key pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRef {
    pub host_table: String,
    /// Column holding ids of records on the link field's own table.
    pub self_key: String,
    /// Column holding ids of records on the foreign table.
    pub foreign_key: String,
}

/// Which column of a foreign-key host a lookup is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySide {
    SelfKey,
    ForeignKey,
}

pub trait CalcSource: Sync {
    /// Dependency edges among all fields weakly connected to `field_ids`. Implementations may
    /// over-fetch; callers narrow the result with [`crate::topo::filter_directed_graph`].
    fn reachable_edges(
        &self,
        field_ids: &[FieldId],
    ) -> impl Future<Output = Result<Vec<FieldEdge>, CalcError>> + Send;

    /// Field definitions for the given ids. Unknown ids are skipped.
    fn fields(
        &self,
        field_ids: &[FieldId],
    ) -> impl Future<Output = Result<Vec<Field>, CalcError>> + Send;

    fn table_fields(
        &self,
        table_id: &TableId,
    ) -> impl Future<Output = Result<Vec<Field>, CalcError>> + Send;

    /// Physical table name per logical table id.
    fn db_table_names(
        &self,
        table_ids: &[TableId],
    ) -> impl Future<Output = Result<BTreeMap<TableId, String>, CalcError>> + Send;

    /// Link fields whose title field is one of `field_ids`.
    fn link_fields_by_lookup_field(
        &self,
        field_ids: &[FieldId],
    ) -> impl Future<Output = Result<Vec<Field>, CalcError>> + Send;

    /// Records by id. Unknown ids are skipped.
    fn records(
        &self,
        table_id: &TableId,
        record_ids: &[RecordId],
    ) -> impl Future<Output = Result<Vec<Record>, CalcError>> + Send;

    /// A page of record ids in stable order.
    fn record_ids(
        &self,
        table_id: &TableId,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RecordId>, CalcError>> + Send;

    /// `(self_id, foreign_id)` pairs stored in `fk`'s host table whose `side` column is in `ids`.
    fn fk_pairs(
        &self,
        fk: &ForeignKeyRef,
        side: KeySide,
        ids: &[RecordId],
    ) -> impl Future<Output = Result<Vec<(RecordId, RecordId)>, CalcError>> + Send;

    fn field_map(
        &self,
        field_ids: &[FieldId],
    ) -> impl Future<Output = Result<FieldMap, CalcError>> + Send {
        async move {
            Ok(self
                .fields(field_ids)
                .await?
                .into_iter()
                .map(|field| (field.id.clone(), field))
                .collect())
        }
    }
}

/// Formula evaluation. Implementations own parsing, typing and formatting; an `Err` marks a
/// single cell as failed and never aborts a calculation pass.
pub trait Evaluator: Sync {
    fn evaluate(
        &self,
        expression: &str,
        fields: &FieldMap,
        record: &Record,
        timezone: Option<&str>,
    ) -> Result<Option<CellValue>, CalcError>;
}
