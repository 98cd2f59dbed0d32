//! Affected-record resolution.
//!
//! Translates "these records changed" into "these records of `field`'s table must be
//! recalculated, and these foreign records supply their values". Fields that do not read through
//! a link map every record onto itself. Link-reading fields follow the link's foreign-key host,
//! adjusted by a pending [`FkOverlay`] of link edits that the host has not yet persisted.

use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
};

use crate::{
    changes::ChangeCollector,
    error::CalcError,
    filter::RecordFilter,
    properties::{dedup, Field, FieldId, FieldMap, Record, RecordId, TableId},
    query::{CalcSource, KeySide, DEFAULT_PAGE_SIZE},
};

/// `to_id` must be recalculated; `from_id` is the foreign record that supplies its value.
///
/// A link-reading target with no contributing foreign record carries `from_id: None`, so the
/// calculator can clear it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedRecord {
    pub to_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<RecordId>,
}

impl AffectedRecord {
    pub fn new<T: Into<RecordId>>(to_id: T, from_id: Option<RecordId>) -> Self {
        AffectedRecord {
            to_id: to_id.into(),
            from_id,
        }
    }
}

/// Link keys of one record before and after a pending edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FkRecordItem {
    #[serde(default)]
    pub old_key: Vec<RecordId>,
    #[serde(default)]
    pub new_key: Vec<RecordId>,
}

impl FkRecordItem {
    pub fn new(old_key: Vec<RecordId>, new_key: Vec<RecordId>) -> Self {
        FkRecordItem { old_key, new_key }
    }

    /// Keys present before the edit and gone after it.
    pub fn removed(&self) -> impl Iterator<Item = &RecordId> + '_ {
        self.old_key.iter().filter(|id| !self.new_key.contains(id))
    }

    /// Keys introduced by the edit.
    pub fn added(&self) -> impl Iterator<Item = &RecordId> + '_ {
        self.new_key.iter().filter(|id| !self.old_key.contains(id))
    }

    fn touches(&self, id: &RecordId) -> bool {
        self.old_key.contains(id) || self.new_key.contains(id)
    }
}

/// Pending link edits of one link field, keyed by record on the field's own table.
pub type FkRecordMap = BTreeMap<RecordId, FkRecordItem>;

/// Pending link edits keyed by link field.
pub type FkOverlay = BTreeMap<FieldId, FkRecordMap>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkDelta {
    Added,
    Removed,
}

/// Re-keys `map` by the other side of the link: every removed key registers a removal against
/// that key, every added key registers an addition.
pub fn revert_fk_map(map: &FkRecordMap) -> FkRecordMap {
    let mut reverted = FkRecordMap::new();
    for (record_id, item) in map.iter() {
        for foreign_id in item.removed() {
            let entry: &mut FkRecordItem = reverted.entry(foreign_id.clone()).or_default();
            if !entry.old_key.contains(record_id) {
                entry.old_key.push(record_id.clone());
            }
        }
        for foreign_id in item.added() {
            let entry: &mut FkRecordItem = reverted.entry(foreign_id.clone()).or_default();
            if !entry.new_key.contains(record_id) {
                entry.new_key.push(record_id.clone());
            }
        }
    }
    reverted
}

/// The `(record, linked record, delta)` triples described by `map`.
pub fn fk_partition(map: &FkRecordMap) -> BTreeSet<(RecordId, RecordId, LinkDelta)> {
    let mut out = BTreeSet::new();
    for (record_id, item) in map.iter() {
        out.extend(
            item.removed()
                .map(|id| (record_id.clone(), id.clone(), LinkDelta::Removed)),
        );
        out.extend(
            item.added()
                .map(|id| (record_id.clone(), id.clone(), LinkDelta::Added)),
        );
    }
    out
}

/// Result of one resolution: the affected records plus any recovered configuration warnings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub records: Vec<AffectedRecord>,
    pub warnings: Vec<CalcError>,
}

impl Resolution {
    /// Target record ids, in first-seen order.
    pub fn target_ids(&self) -> Vec<RecordId> {
        let mut seen = BTreeSet::new();
        self.records
            .iter()
            .filter(|item| seen.insert(&item.to_id))
            .map(|item| item.to_id.clone())
            .collect()
    }

    /// Contributing foreign record ids per target.
    pub fn sources_by_target(&self) -> BTreeMap<RecordId, Vec<RecordId>> {
        let mut out: BTreeMap<RecordId, Vec<RecordId>> = BTreeMap::new();
        for item in self.records.iter() {
            let sources = out.entry(item.to_id.clone()).or_default();
            if let Some(from_id) = &item.from_id {
                sources.push(from_id.clone());
            }
        }
        out
    }
}

pub struct AffectedRecordResolver<'a, S: CalcSource> {
    source: &'a S,
    fields: &'a FieldMap,
    overlay: Option<&'a FkOverlay>,
    pending: Option<&'a ChangeCollector>,
    chunk_size: usize,
}

impl<'a, S: CalcSource> AffectedRecordResolver<'a, S> {
    pub fn new(source: &'a S, fields: &'a FieldMap, overlay: Option<&'a FkOverlay>) -> Self {
        AffectedRecordResolver {
            source,
            fields,
            overlay,
            pending: None,
            chunk_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Values collected earlier in the same pass, laid over records read for filtering.
    pub fn with_pending(mut self, pending: &'a ChangeCollector) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Records of `field`'s table to recalculate.
    ///
    /// `from_ids` are changed records on the foreign side of `field`'s link; `to_ids` are records
    /// of `field`'s own table that changed directly.
    pub async fn resolve(
        &self,
        field: &Field,
        from_ids: &[RecordId],
        to_ids: &[RecordId],
    ) -> Result<Resolution, CalcError> {
        if !field.reads_through_link() {
            return self_mapped(field, from_ids, to_ids);
        }

        let link = self.link_field(field)?;
        let Some(link_options) = link.link_options() else {
            return Err(CalcError::DependencyResolution(format!(
                "field {} is not a link field",
                link.id
            )));
        };
        let fk = link_options.foreign_key_ref();
        let overlay = self.overlay_for(link);
        let overlay = overlay.as_deref();

        // Candidate targets: records linked to a changed foreign record, plus direct edits.
        let mut targets: Vec<RecordId> = Vec::new();
        if !from_ids.is_empty() {
            for chunk in from_ids.chunks(self.chunk_size) {
                let pairs = self.source.fk_pairs(&fk, KeySide::ForeignKey, chunk).await?;
                targets.extend(pairs.into_iter().map(|(self_id, _)| self_id));
            }
            if let Some(overlay) = overlay {
                targets.extend(
                    overlay
                        .iter()
                        .filter(|(_, item)| from_ids.iter().any(|id| item.touches(id)))
                        .map(|(self_id, _)| self_id.clone()),
                );
            }
        }
        targets.extend(to_ids.iter().cloned());
        let targets = dedup(targets);
        if targets.is_empty() {
            return Ok(Resolution::default());
        }

        let mut pairs = Vec::new();
        for chunk in targets.chunks(self.chunk_size) {
            pairs.extend(self.source.fk_pairs(&fk, KeySide::SelfKey, chunk).await?);
        }
        let target_set: BTreeSet<&RecordId> = targets.iter().collect();
        let pairs = apply_overlay(pairs, &target_set, overlay);

        let mut warnings = Vec::new();
        let pairs = match field.filter() {
            Some(filter) if field.link_options().is_none() => {
                let foreign_table = field
                    .lookup_options()
                    .map(|o| o.foreign_table_id.clone())
                    .unwrap_or_else(|| link_options.foreign_table_id.clone());
                match self.check_filter(field, filter, &foreign_table).await? {
                    None => self.filter_pairs(pairs, filter, &foreign_table).await?,
                    Some(warning) => {
                        warnings.push(warning);
                        pairs
                    }
                }
            }
            _ => pairs,
        };

        let mut by_target: BTreeMap<&RecordId, Vec<&RecordId>> = BTreeMap::new();
        for (self_id, foreign_id) in pairs.iter() {
            by_target.entry(self_id).or_default().push(foreign_id);
        }
        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for target in targets.iter() {
            match by_target.get(target) {
                Some(sources) => {
                    for source in sources {
                        let item = AffectedRecord::new(target, Some((*source).clone()));
                        if seen.insert(item.clone()) {
                            records.push(item);
                        }
                    }
                }
                None => {
                    let item = AffectedRecord::new(target, None);
                    if seen.insert(item.clone()) {
                        records.push(item);
                    }
                }
            }
        }
        tracing::debug!(
            "[AffectedRecordResolver.resolve] {}: {} targets, {} affected pairs",
            field.id,
            targets.len(),
            records.len()
        );
        Ok(Resolution { records, warnings })
    }

    fn link_field<'f>(&'f self, field: &'f Field) -> Result<&'f Field, CalcError> {
        if field.link_options().is_some() {
            return Ok(field);
        }
        let link_id = field.link_field_id().ok_or_else(|| {
            CalcError::DependencyResolution(format!("field {} has no link field", field.id))
        })?;
        self.fields.get(link_id).ok_or_else(|| {
            CalcError::DependencyResolution(format!(
                "link field {link_id} of {} is not loaded",
                field.id
            ))
        })
    }

    /// The pending edits seen from `link`'s side: its own entry, or the reverted entry of its
    /// symmetric field.
    fn overlay_for(&self, link: &Field) -> Option<Cow<'a, FkRecordMap>> {
        let overlay = self.overlay?;
        if let Some(own) = overlay.get(&link.id) {
            return Some(Cow::Borrowed(own));
        }
        let symmetric = link.link_options()?.symmetric_field_id.as_ref()?;
        overlay
            .get(symmetric)
            .map(|map| Cow::Owned(revert_fk_map(map)))
    }

    /// A configuration warning when the filter reads a field that does not exist on the foreign
    /// table.
    async fn check_filter(
        &self,
        field: &Field,
        filter: &RecordFilter,
        foreign_table: &TableId,
    ) -> Result<Option<CalcError>, CalcError> {
        let wanted: Vec<FieldId> = filter.field_ids().into_iter().collect();
        let known: BTreeSet<FieldId> = self
            .source
            .fields(&wanted)
            .await?
            .into_iter()
            .filter(|f| &f.table_id == foreign_table)
            .map(|f| f.id)
            .collect();
        let missing: Vec<String> = wanted
            .iter()
            .filter(|id| !known.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if missing.is_empty() {
            return Ok(None);
        }
        let warning = CalcError::Configuration(format!(
            "filter of field {} references unknown fields [{}]; filtering disabled",
            field.id,
            missing.join(", ")
        ));
        tracing::warn!("[AffectedRecordResolver.check_filter] {warning}");
        Ok(Some(warning))
    }

    async fn filter_pairs(
        &self,
        pairs: Vec<(RecordId, RecordId)>,
        filter: &RecordFilter,
        foreign_table: &TableId,
    ) -> Result<Vec<(RecordId, RecordId)>, CalcError> {
        let foreign_ids = dedup(pairs.iter().map(|(_, foreign_id)| foreign_id.clone()));
        let mut passing = BTreeSet::new();
        for chunk in foreign_ids.chunks(self.chunk_size) {
            for mut record in self.source.records(foreign_table, chunk).await? {
                if let Some(pending) = self.pending {
                    overlay_pending(&mut record, pending, foreign_table);
                }
                if filter.matches(&record) {
                    passing.insert(record.id);
                }
            }
        }
        Ok(pairs
            .into_iter()
            .filter(|(_, foreign_id)| passing.contains(foreign_id))
            .collect())
    }
}

/// Lays values collected earlier in the pass over a freshly read record.
pub(crate) fn overlay_pending(record: &mut Record, pending: &ChangeCollector, table_id: &TableId) {
    if let Some(changes) = pending.record_changes(table_id, &record.id) {
        for (field_id, change) in changes.iter() {
            record.set(field_id, change.new_value.clone());
        }
    }
}

fn self_mapped(
    field: &Field,
    from_ids: &[RecordId],
    to_ids: &[RecordId],
) -> Result<Resolution, CalcError> {
    if from_ids.is_empty() && to_ids.is_empty() {
        return Err(CalcError::DependencyResolution(format!(
            "no record ids supplied for field {}",
            field.id
        )));
    }
    let records = dedup(from_ids.iter().chain(to_ids.iter()).cloned())
        .into_iter()
        .map(|id| AffectedRecord {
            from_id: Some(id.clone()),
            to_id: id,
        })
        .collect();
    Ok(Resolution {
        records,
        warnings: vec![],
    })
}

/// Stored pairs minus pending removals plus pending additions for `targets`.
fn apply_overlay(
    pairs: Vec<(RecordId, RecordId)>,
    targets: &BTreeSet<&RecordId>,
    overlay: Option<&FkRecordMap>,
) -> Vec<(RecordId, RecordId)> {
    let Some(overlay) = overlay else {
        return dedup(pairs);
    };
    let mut out: Vec<(RecordId, RecordId)> = pairs
        .into_iter()
        .filter(|(self_id, foreign_id)| {
            !overlay
                .get(self_id)
                .is_some_and(|item| item.removed().any(|id| id == foreign_id))
        })
        .collect();
    for (self_id, item) in overlay.iter() {
        if !targets.contains(self_id) {
            continue;
        }
        out.extend(item.added().map(|id| (self_id.clone(), id.clone())));
    }
    dedup(out)
}
