//! Change collection for a calculation pass.
//!
//! Every recomputed cell whose value differs from the stored one becomes a [`Change`]. The
//! [`ChangeCollector`] merges repeated writes to the same `(table, record, field)` cell: the latest
//! new value wins, the earliest old value is kept, and a cell that ends where it started is
//! dropped. [`ChangeSet`] is the table/record/field-bucketed hand-off form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::properties::{CellValue, FieldId, RecordId, TableId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub field_id: FieldId,
    pub old_value: Option<CellValue>,
    pub new_value: Option<CellValue>,
}

impl Change {
    pub fn new<T, R, F>(
        table_id: T,
        record_id: R,
        field_id: F,
        old_value: Option<CellValue>,
        new_value: Option<CellValue>,
    ) -> Change
    where
        T: Into<TableId>,
        R: Into<RecordId>,
        F: Into<FieldId>,
    {
        Change {
            table_id: table_id.into(),
            record_id: record_id.into(),
            field_id: field_id.into(),
            old_value,
            new_value,
        }
    }

    pub fn is_noop(&self) -> bool {
        values_equal(self.old_value.as_ref(), self.new_value.as_ref())
    }
}

/// Structural equality of two cell values. Null and absent are the same value, and numbers compare
/// by magnitude so that `30` and `30.0` are not a change.
pub fn values_equal(a: Option<&CellValue>, b: Option<&CellValue>) -> bool {
    match (a.filter(|v| !v.is_null()), b.filter(|v| !v.is_null())) {
        (None, None) => true,
        (Some(a), Some(b)) => json_equal(a, b),
        _ => false,
    }
}

fn json_equal(a: &CellValue, b: &CellValue) -> bool {
    match (a, b) {
        (CellValue::Number(x), CellValue::Number(y)) => x == y || x.as_f64() == y.as_f64(),
        (CellValue::Array(xs), CellValue::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (CellValue::Object(xs), CellValue::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
        }
        _ => a == b,
    }
}

/// The raw before/after pair of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOp {
    pub old_value: Option<CellValue>,
    pub new_value: Option<CellValue>,
}

/// Field operations of one record.
pub type RecordOps = BTreeMap<FieldId, FieldOp>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub tables: BTreeMap<TableId, BTreeMap<RecordId, RecordOps>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of changed cells.
    pub fn len(&self) -> usize {
        self.tables
            .values()
            .flat_map(|records| records.values())
            .map(|ops| ops.len())
            .sum()
    }

    pub fn record_ops(&self, table_id: &TableId, record_id: &RecordId) -> Option<&RecordOps> {
        self.tables.get(table_id)?.get(record_id)
    }

    pub fn changes(&self) -> impl Iterator<Item = Change> + '_ {
        self.tables.iter().flat_map(|(table_id, records)| {
            records.iter().flat_map(move |(record_id, ops)| {
                ops.iter().map(move |(field_id, op)| Change {
                    table_id: table_id.clone(),
                    record_id: record_id.clone(),
                    field_id: field_id.clone(),
                    old_value: op.old_value.clone(),
                    new_value: op.new_value.clone(),
                })
            })
        })
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        let mut set = ChangeSet::default();
        for change in iter {
            set.tables
                .entry(change.table_id)
                .or_default()
                .entry(change.record_id)
                .or_default()
                .insert(
                    change.field_id,
                    FieldOp {
                        old_value: change.old_value,
                        new_value: change.new_value,
                    },
                );
        }
        set
    }
}

type CellKey = (TableId, RecordId, FieldId);

#[derive(Debug, Clone, Default)]
pub struct ChangeCollector {
    cells: BTreeMap<TableId, BTreeMap<RecordId, BTreeMap<FieldId, Change>>>,
    order: Vec<CellKey>,
}

impl ChangeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `change` into the collector.
    pub fn push(&mut self, change: Change) {
        let fields = self
            .cells
            .entry(change.table_id.clone())
            .or_default()
            .entry(change.record_id.clone())
            .or_default();
        match fields.get_mut(&change.field_id) {
            Some(existing) => existing.new_value = change.new_value,
            None => {
                self.order.push((
                    change.table_id.clone(),
                    change.record_id.clone(),
                    change.field_id.clone(),
                ));
                fields.insert(change.field_id.clone(), change);
            }
        }
    }

    pub fn get(
        &self,
        table_id: &TableId,
        record_id: &RecordId,
        field_id: &FieldId,
    ) -> Option<&Change> {
        self.record_changes(table_id, record_id)?.get(field_id)
    }

    /// Collected (possibly no-op) changes of one record, keyed by field.
    pub fn record_changes(
        &self,
        table_id: &TableId,
        record_id: &RecordId,
    ) -> Option<&BTreeMap<FieldId, Change>> {
        self.cells.get(table_id)?.get(record_id)
    }

    /// Number of effective changes.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Effective changes in first-write order.
    pub fn iter(&self) -> impl Iterator<Item = &Change> + '_ {
        self.order
            .iter()
            .filter_map(|(table_id, record_id, field_id)| {
                self.get(table_id, record_id, field_id)
            })
            .filter(|change| !change.is_noop())
    }

    pub fn changes(&self) -> Vec<Change> {
        self.iter().cloned().collect()
    }

    pub fn change_set(&self) -> ChangeSet {
        self.iter().cloned().collect()
    }
}

impl Extend<Change> for ChangeCollector {
    fn extend<I: IntoIterator<Item = Change>>(&mut self, iter: I) {
        for change in iter {
            self.push(change);
        }
    }
}
