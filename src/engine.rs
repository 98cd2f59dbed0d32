//! Calculation orchestration.
//!
//! A pass moves through [`CalcPhase`]s:
//!
//! ```text
//! Idle -> GraphLoaded -> Ordered -> (PerNodeResolving <-> PerNodeCalculating)* -> Collecting -> Done
//!                            \-> Failed (cycle)
//! ```
//!
//! The engine loads the subgraph around the seed fields, orders it, and visits each field once.
//! A field is skipped when neither it nor any of its dependencies has pending records. Otherwise
//! its affected records are resolved, recalculated and diffed, and every target record is handed
//! on to the field's dependents. A cycle aborts the pass before any value is computed; a failing
//! cell degrades to null and the pass continues.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::{
    calc::{calculate_field, CalcInputs},
    changes::{values_equal, Change, ChangeCollector, ChangeSet},
    config::CalcConfig,
    error::CalcError,
    properties::{dedup, Field, FieldId, Record, RecordId, TableId, UserMap},
    query::{CalcSource, Evaluator},
    resolve::{overlay_pending, revert_fk_map, AffectedRecordResolver, FkOverlay},
    store::{CalcContext, GraphAccessor},
    topo::{prepend_start_field_ids, topo_orders, TopoItem},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalcPhase {
    Idle,
    GraphLoaded,
    Ordered,
    PerNodeResolving,
    PerNodeCalculating,
    Collecting,
    Done,
    Failed,
}

/// A field whose value changed on `record_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcSeed {
    pub field_id: FieldId,
    pub record_ids: Vec<RecordId>,
}

impl CalcSeed {
    pub fn new<F, I, R>(field_id: F, record_ids: I) -> Self
    where
        F: Into<FieldId>,
        I: IntoIterator<Item = R>,
        R: Into<RecordId>,
    {
        CalcSeed {
            field_id: field_id.into(),
            record_ids: record_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcRequest {
    pub seeds: Vec<CalcSeed>,
    /// Link edits made in the same transaction but not yet persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_overlay: Option<FkOverlay>,
    /// Current user records, used to refresh created-by/modified-by projections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<UserMap>,
}

impl CalcRequest {
    pub fn new(seeds: Vec<CalcSeed>) -> Self {
        CalcRequest {
            seeds,
            ..Default::default()
        }
    }

    pub fn with_overlay(mut self, overlay: FkOverlay) -> Self {
        self.fk_overlay = Some(overlay);
        self
    }

    pub fn with_users(mut self, users: UserMap) -> Self {
        self.users = Some(users);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcReport {
    pub pass_id: Uuid,
    pub phase: CalcPhase,
    /// Effective changes in first-write order.
    pub changes: Vec<Change>,
    /// Recovered configuration problems, e.g. filters on unknown fields.
    pub warnings: Vec<CalcError>,
    /// Cells that failed to evaluate and were cleared.
    pub cell_errors: Vec<CalcError>,
}

impl CalcReport {
    fn new(pass_id: Uuid) -> Self {
        CalcReport {
            pass_id,
            phase: CalcPhase::Idle,
            changes: vec![],
            warnings: vec![],
            cell_errors: vec![],
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change_set(&self) -> ChangeSet {
        self.changes.iter().cloned().collect()
    }

    /// The change of one cell, if any.
    pub fn change(&self, record_id: &str, field_id: &str) -> Option<&Change> {
        self.changes
            .iter()
            .find(|c| c.record_id.as_str() == record_id && c.field_id.as_str() == field_id)
    }
}

struct PhaseTracker {
    pass_id: Uuid,
    phase: CalcPhase,
}

impl PhaseTracker {
    fn new(pass_id: Uuid) -> Self {
        PhaseTracker {
            pass_id,
            phase: CalcPhase::Idle,
        }
    }

    fn enter(&mut self, next: CalcPhase) {
        if self.phase == next {
            return;
        }
        match next {
            CalcPhase::PerNodeResolving | CalcPhase::PerNodeCalculating => tracing::trace!(
                "[ReferenceEngine] pass {}: {:?} -> {:?}",
                self.pass_id,
                self.phase,
                next
            ),
            _ => tracing::debug!(
                "[ReferenceEngine] pass {}: {:?} -> {:?}",
                self.pass_id,
                self.phase,
                next
            ),
        }
        self.phase = next;
    }
}

struct Plan {
    ctx: CalcContext,
    order: Vec<TopoItem>,
}

/// Records read during one pass, kept current with the values the pass computes.
struct RecordCache {
    chunk_size: usize,
    tables: BTreeMap<TableId, BTreeMap<RecordId, Record>>,
}

impl RecordCache {
    fn new(chunk_size: usize) -> Self {
        RecordCache {
            chunk_size: chunk_size.max(1),
            tables: BTreeMap::new(),
        }
    }

    async fn load<S: CalcSource>(
        &mut self,
        source: &S,
        table_id: &TableId,
        record_ids: &[RecordId],
        pending: &ChangeCollector,
    ) -> Result<(), CalcError> {
        let table = self.tables.entry(table_id.clone()).or_default();
        let missing: Vec<RecordId> = record_ids
            .iter()
            .filter(|id| !table.contains_key(*id))
            .cloned()
            .collect();
        for chunk in missing.chunks(self.chunk_size) {
            for mut record in source.records(table_id, chunk).await? {
                overlay_pending(&mut record, pending, table_id);
                table.insert(record.id.clone(), record);
            }
        }
        Ok(())
    }

    fn get(&self, table_id: &TableId, record_id: &RecordId) -> Option<&Record> {
        self.tables.get(table_id)?.get(record_id)
    }

    fn set(
        &mut self,
        table_id: &TableId,
        record_id: &RecordId,
        field_id: &FieldId,
        value: Option<crate::properties::CellValue>,
    ) {
        if let Some(record) = self
            .tables
            .get_mut(table_id)
            .and_then(|table| table.get_mut(record_id))
        {
            record.set(field_id, value);
        }
    }
}

/// Everything that varies between passes over one [`Plan`].
struct PassInput<'p> {
    seeds: &'p [CalcSeed],
    overlay: Option<&'p FkOverlay>,
    users: Option<&'p UserMap>,
}

pub struct ReferenceEngine<S: CalcSource, E: Evaluator> {
    source: S,
    evaluator: E,
    config: CalcConfig,
}

impl<S: CalcSource, E: Evaluator> ReferenceEngine<S, E> {
    pub fn new(source: S, evaluator: E, config: CalcConfig) -> Self {
        ReferenceEngine {
            source,
            evaluator,
            config,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn config(&self) -> &CalcConfig {
        &self.config
    }

    /// Rejects a schema edit that would give `field_id` a cyclic dependency.
    pub async fn validate_references(
        &self,
        field_id: &FieldId,
        dependency_ids: &[FieldId],
    ) -> Result<(), CalcError> {
        GraphAccessor::new(&self.source, &self.config)
            .validate_references(field_id, dependency_ids)
            .await
    }

    /// Fields a change to `field_id` would recompute, in calculation order.
    pub async fn plan_affected_fields(&self, field_id: &FieldId) -> Result<Vec<FieldId>, CalcError> {
        GraphAccessor::new(&self.source, &self.config)
            .plan_affected_fields(field_id)
            .await
    }

    /// Recomputes everything derived from the request's seeds.
    pub async fn calculate(&self, request: CalcRequest) -> Result<CalcReport, CalcError> {
        let pass_id = Uuid::new_v4();
        let mut phase = PhaseTracker::new(pass_id);
        let mut report = CalcReport::new(pass_id);
        let mut collector = ChangeCollector::new();

        let seeds = self.expand_seeds(&request).await?;
        if seeds.iter().all(|seed| seed.record_ids.is_empty()) {
            tracing::debug!("[ReferenceEngine.calculate] pass {pass_id}: nothing to do");
            return Ok(self.finish(report, collector, &mut phase));
        }
        let start_ids: Vec<FieldId> = seeds.iter().map(|seed| seed.field_id.clone()).collect();
        let plan = self.plan(&start_ids, &mut phase).await?;
        let input = PassInput {
            seeds: &seeds,
            overlay: request.fk_overlay.as_ref(),
            users: request.users.as_ref(),
        };
        self.run_pass(&plan, &input, &mut collector, &mut report, &mut phase)
            .await?;
        Ok(self.finish(report, collector, &mut phase))
    }

    /// Computes `field_ids` over every record of `table_id`, page by page, together with
    /// everything derived from them. Used after creating fields or changing their options.
    pub async fn calculate_fields(
        &self,
        table_id: &TableId,
        field_ids: &[FieldId],
    ) -> Result<CalcReport, CalcError> {
        let pass_id = Uuid::new_v4();
        let mut phase = PhaseTracker::new(pass_id);
        let mut report = CalcReport::new(pass_id);
        let mut collector = ChangeCollector::new();
        if field_ids.is_empty() {
            return Ok(self.finish(report, collector, &mut phase));
        }

        let plan = self.plan(field_ids, &mut phase).await?;
        let page_size = self.config.chunk_size.max(1);
        let mut offset = 0;
        loop {
            let page = self
                .source
                .record_ids(table_id, offset, page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            tracing::debug!(
                "[ReferenceEngine.calculate_fields] pass {pass_id}: {table_id} records {}..{}",
                offset,
                offset + page.len()
            );
            let seeds: Vec<CalcSeed> = field_ids
                .iter()
                .map(|field_id| CalcSeed::new(field_id, page.iter()))
                .collect();
            let input = PassInput {
                seeds: &seeds,
                overlay: None,
                users: None,
            };
            self.run_pass(&plan, &input, &mut collector, &mut report, &mut phase)
                .await?;
            offset += page.len();
            if page.len() < page_size {
                break;
            }
        }
        Ok(self.finish(report, collector, &mut phase))
    }

    /// Recomputes every computed field of `table_id` over all of its records.
    pub async fn calculate_table(&self, table_id: &TableId) -> Result<CalcReport, CalcError> {
        let field_ids: Vec<FieldId> = self
            .source
            .table_fields(table_id)
            .await?
            .into_iter()
            .filter(Field::is_computed)
            .map(|field| field.id)
            .collect();
        self.calculate_fields(table_id, &field_ids).await
    }

    /// Request seeds plus the link fields named by the overlay and their symmetric fields.
    async fn expand_seeds(&self, request: &CalcRequest) -> Result<Vec<CalcSeed>, CalcError> {
        let mut seeds = request.seeds.clone();
        let Some(overlay) = &request.fk_overlay else {
            return Ok(seeds);
        };
        let link_ids: Vec<FieldId> = overlay.keys().cloned().collect();
        let links = self.source.field_map(&link_ids).await?;
        for (link_id, map) in overlay.iter() {
            seeds.push(CalcSeed::new(link_id, map.keys()));
            let symmetric = links
                .get(link_id)
                .and_then(|field| field.link_options())
                .and_then(|options| options.symmetric_field_id.as_ref());
            if let Some(symmetric) = symmetric {
                let reverted = revert_fk_map(map);
                seeds.push(CalcSeed::new(symmetric, reverted.keys()));
            }
        }
        Ok(seeds)
    }

    async fn plan(&self, start_ids: &[FieldId], phase: &mut PhaseTracker) -> Result<Plan, CalcError> {
        let ctx = GraphAccessor::new(&self.source, &self.config)
            .load_context(start_ids)
            .await?;
        phase.enter(CalcPhase::GraphLoaded);
        let order = match topo_orders(&ctx.edges) {
            Ok(order) => order,
            Err(e) => {
                phase.enter(CalcPhase::Failed);
                tracing::error!(
                    "[ReferenceEngine.plan] pass {} aborted before calculation: {e}",
                    phase.pass_id
                );
                return Err(e);
            }
        };
        let order = prepend_start_field_ids(order, &ctx.start_ids);
        phase.enter(CalcPhase::Ordered);
        Ok(Plan { ctx, order })
    }

    async fn run_pass(
        &self,
        plan: &Plan,
        input: &PassInput<'_>,
        collector: &mut ChangeCollector,
        report: &mut CalcReport,
        phase: &mut PhaseTracker,
    ) -> Result<(), CalcError> {
        let mut dirty: BTreeMap<FieldId, Vec<RecordId>> = BTreeMap::new();
        for seed in input.seeds.iter() {
            merge_ids(
                dirty.entry(seed.field_id.clone()).or_default(),
                seed.record_ids.iter().cloned(),
            );
        }
        let inputs = CalcInputs {
            fields: &plan.ctx.fields,
            evaluator: &self.evaluator,
            users: input.users,
            default_timezone: &self.config.default_timezone,
        };
        let mut cache = RecordCache::new(self.config.chunk_size);

        for item in plan.order.iter() {
            let Some(field) = plan.ctx.fields.get(&item.id) else {
                if item.dependencies.is_empty() {
                    // Referenced (e.g. by a filter) but deleted; nothing to compute or propagate.
                    tracing::warn!(
                        "[ReferenceEngine.run_pass] {} is referenced but has no definition",
                        item.id
                    );
                    continue;
                }
                return Err(CalcError::DependencyResolution(format!(
                    "field {} is part of the dependency graph but has no definition",
                    item.id
                )));
            };
            let (from_ids, to_ids) = pending_ids(field, item, &dirty);
            if from_ids.is_empty() && to_ids.is_empty() {
                tracing::trace!("[ReferenceEngine.run_pass] {}: no pending records", field.id);
                continue;
            }
            if !field.is_computed() {
                merge_ids(dirty.entry(field.id.clone()).or_default(), to_ids);
                continue;
            }

            phase.enter(CalcPhase::PerNodeResolving);
            let resolution = {
                let resolver =
                    AffectedRecordResolver::new(&self.source, &plan.ctx.fields, input.overlay)
                        .with_pending(collector)
                        .with_chunk_size(self.config.chunk_size);
                resolver.resolve(field, &from_ids, &to_ids).await?
            };
            let targets = resolution.target_ids();
            let sources_by_target = resolution.sources_by_target();
            report.warnings.extend(resolution.warnings);

            phase.enter(CalcPhase::PerNodeCalculating);
            cache
                .load(&self.source, &field.table_id, &targets, collector)
                .await?;
            let foreign_table = foreign_table_of(field, &plan.ctx);
            if let Some(foreign_table) = &foreign_table {
                let foreign_ids: Vec<RecordId> = dedup(sources_by_target.values().flatten().cloned());
                cache
                    .load(&self.source, foreign_table, &foreign_ids, collector)
                    .await?;
            }

            let mut results = Vec::with_capacity(targets.len());
            for target in targets.iter() {
                let Some(record) = cache.get(&field.table_id, target) else {
                    tracing::debug!(
                        "[ReferenceEngine.run_pass] {}: record {target} no longer exists",
                        field.id
                    );
                    continue;
                };
                let sources: Vec<&Record> = match (&foreign_table, sources_by_target.get(target)) {
                    (Some(foreign_table), Some(ids)) => ids
                        .iter()
                        .filter_map(|id| cache.get(foreign_table, id))
                        .collect(),
                    _ => vec![],
                };
                let new_value = match calculate_field(&inputs, field, record, &sources) {
                    Ok(value) => value,
                    Err(e) if !e.is_fatal() => {
                        tracing::error!("[ReferenceEngine.run_pass] {e}; value cleared");
                        report.cell_errors.push(e);
                        None
                    }
                    Err(e) => return Err(e),
                };
                results.push((target.clone(), record.get(&field.id).cloned(), new_value));
            }

            let mut changed = 0;
            for (record_id, old_value, new_value) in results {
                if values_equal(old_value.as_ref(), new_value.as_ref()) {
                    continue;
                }
                changed += 1;
                cache.set(&field.table_id, &record_id, &field.id, new_value.clone());
                collector.push(Change::new(
                    &field.table_id,
                    record_id,
                    &field.id,
                    old_value,
                    new_value,
                ));
            }
            tracing::debug!(
                "[ReferenceEngine.run_pass] {}: {} targets, {} changed",
                field.id,
                targets.len(),
                changed
            );
            merge_ids(dirty.entry(field.id.clone()).or_default(), targets);
        }
        Ok(())
    }

    fn finish(
        &self,
        mut report: CalcReport,
        collector: ChangeCollector,
        phase: &mut PhaseTracker,
    ) -> CalcReport {
        phase.enter(CalcPhase::Collecting);
        report.changes = collector.changes();
        phase.enter(CalcPhase::Done);
        report.phase = CalcPhase::Done;
        tracing::info!(
            "[ReferenceEngine] pass {} done: {} changes, {} cell errors, {} warnings",
            report.pass_id,
            report.changes.len(),
            report.cell_errors.len(),
            report.warnings.len()
        );
        report
    }
}

/// Pending record ids for `field`, split by side: `from_ids` are changed foreign records (looked-up
/// or filter fields) reached through the field's link, `to_ids` are records of the field's own
/// table.
fn pending_ids(
    field: &Field,
    item: &TopoItem,
    dirty: &BTreeMap<FieldId, Vec<RecordId>>,
) -> (Vec<RecordId>, Vec<RecordId>) {
    let mut from_ids = Vec::new();
    let mut to_ids = Vec::new();
    if let Some(own) = dirty.get(&field.id) {
        to_ids.extend(own.iter().cloned());
    }
    for dep in item.dependencies.iter() {
        let Some(ids) = dirty.get(dep) else {
            continue;
        };
        if field.reads_foreign_field(dep) {
            from_ids.extend(ids.iter().cloned());
        } else {
            to_ids.extend(ids.iter().cloned());
        }
    }
    (dedup(from_ids), dedup(to_ids))
}

fn foreign_table_of(field: &Field, ctx: &CalcContext) -> Option<TableId> {
    if let Some(options) = field.lookup_options() {
        return Some(options.foreign_table_id.clone());
    }
    if let Some(options) = field.link_options() {
        return Some(options.foreign_table_id.clone());
    }
    field
        .link_field_id()
        .and_then(|link_id| ctx.table_of(link_id))
        .cloned()
}

fn merge_ids<I: IntoIterator<Item = RecordId>>(into: &mut Vec<RecordId>, ids: I) {
    let mut seen: BTreeSet<RecordId> = into.iter().cloned().collect();
    for id in ids {
        if seen.insert(id.clone()) {
            into.push(id);
        }
    }
}
