//! In-process [`CalcSource`].
//!
//! [`MemoryStore`] keeps tables, field definitions, the derived dependency edge table and
//! foreign-key host tables in ordinary collections. It backs the engine in tests and in hosts
//! that keep their working set in memory, and it can apply the [`ChangeSet`] a pass produces.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    changes::ChangeSet,
    error::CalcError,
    properties::{CellValue, Field, FieldId, Record, RecordId, TableId},
    query::{CalcSource, ForeignKeyRef, KeySide},
    topo::{derive_edges, prune_graph, FieldEdge},
};

#[derive(Debug, Clone, Default)]
struct TableData {
    db_table_name: String,
    records: BTreeMap<RecordId, Record>,
}

/// One row of a foreign-key host table: column name to record id.
pub type FkRow = BTreeMap<String, RecordId>;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: BTreeMap<TableId, TableData>,
    fields: BTreeMap<FieldId, Field>,
    edges: Vec<FieldEdge>,
    fk_hosts: BTreeMap<String, Vec<FkRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table<T: Into<TableId>>(&mut self, table_id: T, db_table_name: &str) {
        self.tables
            .entry(table_id.into())
            .or_default()
            .db_table_name = db_table_name.to_string();
    }

    /// Inserts or replaces a field definition and re-derives the edge table.
    pub fn add_field(&mut self, field: Field) {
        self.fields.insert(field.id.clone(), field);
        self.edges = derive_edges(self.fields.values());
    }

    pub fn remove_field(&mut self, field_id: &FieldId) -> Option<Field> {
        let removed = self.fields.remove(field_id);
        self.edges = derive_edges(self.fields.values());
        removed
    }

    pub fn field(&self, field_id: &FieldId) -> Option<&Field> {
        self.fields.get(field_id)
    }

    pub fn all_fields(&self) -> Vec<Field> {
        self.fields.values().cloned().collect()
    }

    pub fn edges(&self) -> &[FieldEdge] {
        &self.edges
    }

    pub fn insert_record<T: Into<TableId>>(&mut self, table_id: T, record: Record) {
        self.tables
            .entry(table_id.into())
            .or_default()
            .records
            .insert(record.id.clone(), record);
    }

    pub fn record(&self, table_id: &TableId, record_id: &RecordId) -> Option<&Record> {
        self.tables.get(table_id)?.records.get(record_id)
    }

    pub fn record_count(&self, table_id: &TableId) -> usize {
        self.tables
            .get(table_id)
            .map(|table| table.records.len())
            .unwrap_or_default()
    }

    pub fn cell<T, R, F>(&self, table_id: T, record_id: R, field_id: F) -> Option<&CellValue>
    where
        T: Into<TableId>,
        R: Into<RecordId>,
        F: Into<FieldId>,
    {
        self.record(&table_id.into(), &record_id.into())?
            .get(&field_id.into())
    }

    /// Writes a cell directly, as a user edit would. Unknown records are created.
    pub fn set_cell<T, R, F>(&mut self, table_id: T, record_id: R, field_id: F, value: Option<CellValue>)
    where
        T: Into<TableId>,
        R: Into<RecordId>,
        F: Into<FieldId>,
    {
        let record_id = record_id.into();
        self.tables
            .entry(table_id.into())
            .or_default()
            .records
            .entry(record_id.clone())
            .or_insert_with(|| Record::new(record_id))
            .set(&field_id.into(), value);
    }

    fn fk_ref(&self, link_field_id: &FieldId) -> Result<ForeignKeyRef, CalcError> {
        self.fields
            .get(link_field_id)
            .and_then(|field| field.link_options())
            .map(|options| options.foreign_key_ref())
            .ok_or_else(|| CalcError::NotFound(format!("link field {link_field_id}")))
    }

    /// Persists a link between `self_id` (on the link field's table) and `foreign_id`.
    pub fn link<R: Into<RecordId>, F: Into<RecordId>>(
        &mut self,
        link_field_id: &FieldId,
        self_id: R,
        foreign_id: F,
    ) -> Result<(), CalcError> {
        let fk = self.fk_ref(link_field_id)?;
        let row = FkRow::from([
            (fk.self_key.clone(), self_id.into()),
            (fk.foreign_key.clone(), foreign_id.into()),
        ]);
        let rows = self.fk_hosts.entry(fk.host_table).or_default();
        if !rows.contains(&row) {
            rows.push(row);
        }
        Ok(())
    }

    pub fn unlink<R: Into<RecordId>, F: Into<RecordId>>(
        &mut self,
        link_field_id: &FieldId,
        self_id: R,
        foreign_id: F,
    ) -> Result<(), CalcError> {
        let fk = self.fk_ref(link_field_id)?;
        let (self_id, foreign_id) = (self_id.into(), foreign_id.into());
        if let Some(rows) = self.fk_hosts.get_mut(&fk.host_table) {
            rows.retain(|row| {
                row.get(&fk.self_key) != Some(&self_id)
                    || row.get(&fk.foreign_key) != Some(&foreign_id)
            });
        }
        Ok(())
    }

    /// Writes every new value of `changes` into the stored records.
    pub fn apply(&mut self, changes: &ChangeSet) {
        for change in changes.changes() {
            self.set_cell(
                change.table_id,
                change.record_id,
                change.field_id,
                change.new_value,
            );
        }
        tracing::debug!("[MemoryStore.apply] applied {} cell changes", changes.len());
    }
}

impl CalcSource for MemoryStore {
    async fn reachable_edges(&self, field_ids: &[FieldId]) -> Result<Vec<FieldEdge>, CalcError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for field_id in field_ids {
            for edge in prune_graph(field_id, &self.edges) {
                if seen.insert(edge.clone()) {
                    out.push(edge);
                }
            }
        }
        Ok(out)
    }

    async fn fields(&self, field_ids: &[FieldId]) -> Result<Vec<Field>, CalcError> {
        Ok(field_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.fields.get(id).cloned())
            .collect())
    }

    async fn table_fields(&self, table_id: &TableId) -> Result<Vec<Field>, CalcError> {
        Ok(self
            .fields
            .values()
            .filter(|field| &field.table_id == table_id)
            .cloned()
            .collect())
    }

    async fn db_table_names(
        &self,
        table_ids: &[TableId],
    ) -> Result<BTreeMap<TableId, String>, CalcError> {
        Ok(table_ids
            .iter()
            .filter_map(|id| {
                self.tables
                    .get(id)
                    .map(|table| (id.clone(), table.db_table_name.clone()))
            })
            .collect())
    }

    async fn link_fields_by_lookup_field(
        &self,
        field_ids: &[FieldId],
    ) -> Result<Vec<Field>, CalcError> {
        Ok(self
            .fields
            .values()
            .filter(|field| {
                field
                    .link_options()
                    .is_some_and(|options| field_ids.contains(&options.lookup_field_id))
            })
            .cloned()
            .collect())
    }

    async fn records(
        &self,
        table_id: &TableId,
        record_ids: &[RecordId],
    ) -> Result<Vec<Record>, CalcError> {
        let Some(table) = self.tables.get(table_id) else {
            return Ok(vec![]);
        };
        Ok(record_ids
            .iter()
            .filter_map(|id| table.records.get(id).cloned())
            .collect())
    }

    async fn record_ids(
        &self,
        table_id: &TableId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RecordId>, CalcError> {
        Ok(self
            .tables
            .get(table_id)
            .map(|table| {
                table
                    .records
                    .keys()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fk_pairs(
        &self,
        fk: &ForeignKeyRef,
        side: KeySide,
        ids: &[RecordId],
    ) -> Result<Vec<(RecordId, RecordId)>, CalcError> {
        let Some(rows) = self.fk_hosts.get(&fk.host_table) else {
            return Ok(vec![]);
        };
        let wanted: BTreeSet<&RecordId> = ids.iter().collect();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let self_id = row.get(&fk.self_key)?;
                let foreign_id = row.get(&fk.foreign_key)?;
                let key = match side {
                    KeySide::SelfKey => self_id,
                    KeySide::ForeignKey => foreign_id,
                };
                wanted
                    .contains(key)
                    .then(|| (self_id.clone(), foreign_id.clone()))
            })
            .collect())
    }
}
