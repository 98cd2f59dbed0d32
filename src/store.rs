//! Graph store access: loading the dependency subgraph a calculation needs.
//!
//! [`GraphAccessor::load_context`] expands the seed fields to the weakly connected edge set the
//! source knows about, narrows it to what the seeds can actually reach, and resolves the field,
//! table and physical-table metadata a pass consults.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::CalcConfig,
    error::CalcError,
    properties::{dedup, FieldId, FieldMap, TableId},
    query::CalcSource,
    topo::{filter_directed_graph, find_cycle, prune_graph, topo_order_with_start, FieldEdge},
};

/// Everything a pass knows about the fields it may touch.
#[derive(Debug, Clone, Default)]
pub struct CalcContext {
    /// Seed fields, including link fields pulled in because their looked-up field is a seed.
    pub start_ids: Vec<FieldId>,
    pub edges: Vec<FieldEdge>,
    pub fields: FieldMap,
    pub field_tables: BTreeMap<FieldId, TableId>,
    pub db_table_names: BTreeMap<TableId, String>,
    pub db_table_fields: BTreeMap<String, Vec<FieldId>>,
}

impl CalcContext {
    pub fn table_of(&self, field_id: &FieldId) -> Option<&TableId> {
        self.field_tables.get(field_id)
    }
}

pub struct GraphAccessor<'a, S: CalcSource> {
    source: &'a S,
    config: &'a CalcConfig,
}

impl<'a, S: CalcSource> GraphAccessor<'a, S> {
    pub fn new(source: &'a S, config: &'a CalcConfig) -> Self {
        GraphAccessor { source, config }
    }

    /// Edges weakly connected to `field_ids`, expanded to a fixed point.
    ///
    /// Each round asks the source for the edges around the newly discovered fields; a source with
    /// a recursive query converges in one round.
    pub async fn reachable_edges(&self, field_ids: &[FieldId]) -> Result<Vec<FieldEdge>, CalcError> {
        let mut known_fields: BTreeSet<FieldId> = field_ids.iter().cloned().collect();
        let mut known_edges: BTreeSet<FieldEdge> = BTreeSet::new();
        let mut edges = Vec::new();
        let mut frontier: Vec<FieldId> = known_fields.iter().cloned().collect();

        for round in 0..self.config.max_graph_rounds.max(1) {
            if frontier.is_empty() {
                return Ok(edges);
            }
            let fetched = self.source.reachable_edges(&frontier).await?;
            let mut next = Vec::new();
            for edge in fetched {
                if !known_edges.insert(edge.clone()) {
                    continue;
                }
                for id in [&edge.from_field_id, &edge.to_field_id] {
                    if known_fields.insert(id.clone()) {
                        next.push(id.clone());
                    }
                }
                edges.push(edge);
            }
            tracing::debug!(
                "[GraphAccessor.reachable_edges] round {round}: {} edges, {} new fields",
                edges.len(),
                next.len()
            );
            frontier = next;
        }
        if frontier.is_empty() {
            Ok(edges)
        } else {
            Err(CalcError::DependencyResolution(format!(
                "edge expansion did not converge after {} rounds",
                self.config.max_graph_rounds
            )))
        }
    }

    /// Loads the minimal subgraph reachable from `start_ids` plus the metadata of every field in
    /// it.
    #[tracing::instrument(skip(self))]
    pub async fn load_context(&self, start_ids: &[FieldId]) -> Result<CalcContext, CalcError> {
        let mut start_ids = dedup(start_ids.iter().cloned());

        // A link re-renders its titles when its looked-up field changes.
        let title_links = self.source.link_fields_by_lookup_field(&start_ids).await?;
        let mut extra_edges = Vec::new();
        for link in title_links.iter() {
            if let Some(options) = link.link_options() {
                extra_edges.push(FieldEdge::new(&options.lookup_field_id, &link.id));
            }
            if !start_ids.contains(&link.id) {
                start_ids.push(link.id.clone());
            }
        }

        let mut raw = self.reachable_edges(&start_ids).await?;
        for edge in extra_edges {
            if !raw.contains(&edge) {
                raw.push(edge);
            }
        }
        let edges = filter_directed_graph(&raw, &start_ids);

        let mut field_ids: Vec<FieldId> = start_ids.clone();
        for edge in edges.iter() {
            field_ids.push(edge.from_field_id.clone());
            field_ids.push(edge.to_field_id.clone());
        }
        let mut fields = self.source.field_map(&dedup(field_ids)).await?;

        // Link fields traversed by lookups must be loaded even when they are not in the graph.
        let missing_links: Vec<FieldId> = fields
            .values()
            .filter_map(|field| field.link_field_id())
            .filter(|id| !fields.contains_key(*id))
            .cloned()
            .collect();
        if !missing_links.is_empty() {
            fields.extend(self.source.field_map(&dedup(missing_links)).await?);
        }

        let field_tables: BTreeMap<FieldId, TableId> = fields
            .values()
            .map(|field| (field.id.clone(), field.table_id.clone()))
            .collect();
        let table_ids = dedup(field_tables.values().cloned());
        let db_table_names = self.source.db_table_names(&table_ids).await?;
        let mut db_table_fields: BTreeMap<String, Vec<FieldId>> = BTreeMap::new();
        for (field_id, table_id) in field_tables.iter() {
            if let Some(db_name) = db_table_names.get(table_id) {
                db_table_fields
                    .entry(db_name.clone())
                    .or_default()
                    .push(field_id.clone());
            }
        }

        tracing::debug!(
            "[GraphAccessor.load_context] {} start fields, {} edges, {} fields over {} tables",
            start_ids.len(),
            edges.len(),
            fields.len(),
            table_ids.len()
        );
        Ok(CalcContext {
            start_ids,
            edges,
            fields,
            field_tables,
            db_table_names,
            db_table_fields,
        })
    }

    /// Checks that giving `field_id` the dependencies `dependency_ids` keeps the schema acyclic.
    ///
    /// The proposed dependencies replace the field's current incoming edges inside the weakly
    /// connected component around it.
    pub async fn validate_references(
        &self,
        field_id: &FieldId,
        dependency_ids: &[FieldId],
    ) -> Result<(), CalcError> {
        let mut seeds = vec![field_id.clone()];
        seeds.extend(dependency_ids.iter().cloned());
        let raw = self.reachable_edges(&seeds).await?;

        let mut component: Vec<FieldEdge> = seeds
            .iter()
            .flat_map(|seed| prune_graph(seed, &raw))
            .filter(|edge| &edge.to_field_id != field_id)
            .collect();
        component.extend(
            dependency_ids
                .iter()
                .map(|dep| FieldEdge::new(dep, field_id)),
        );

        match find_cycle(&component) {
            Some(culprit) => {
                tracing::warn!(
                    "[GraphAccessor.validate_references] rejecting dependencies of {field_id}: \
                     cycle through {culprit}"
                );
                Err(CalcError::cycle(culprit))
            }
            None => Ok(()),
        }
    }

    /// Fields a change to `field_id` would recompute, in calculation order, `field_id` first.
    pub async fn plan_affected_fields(&self, field_id: &FieldId) -> Result<Vec<FieldId>, CalcError> {
        let edges = self
            .reachable_edges(std::slice::from_ref(field_id))
            .await?;
        topo_order_with_start(field_id, &edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        properties::{Field, FieldKind, FormulaOptions},
        tests::helpers::{formula_field, linked_tables},
    };

    #[test_log::test(tokio::test)]
    async fn test_load_context_narrows_to_reachable() {
        let mut store = linked_tables();
        store.add_field(formula_field("fldDouble", "tblA", "{fldLookup} * 2"));
        store.add_field(formula_field("fldUnrelated", "tblA", "{fldTitle} + 1"));
        let config = CalcConfig::default();
        let accessor = GraphAccessor::new(&store, &config);

        let ctx = accessor.load_context(&["fldValue".into()]).await.unwrap();
        let targets: BTreeSet<&str> = ctx.edges.iter().map(|e| e.to_field_id.as_str()).collect();
        assert!(targets.contains("fldLookup"));
        assert!(targets.contains("fldDouble"));
        assert!(!targets.contains("fldUnrelated"));
        assert!(ctx.fields.contains_key(&FieldId::from("fldLink")));
        assert_eq!(
            ctx.table_of(&"fldLookup".into()),
            Some(&TableId::from("tblA"))
        );
        assert_eq!(ctx.db_table_names[&TableId::from("tblB")], "table_b");
        assert!(ctx.db_table_fields["table_a"].contains(&FieldId::from("fldLookup")));
    }

    #[test_log::test(tokio::test)]
    async fn test_title_change_pulls_in_link_fields() {
        let store = linked_tables();
        let config = CalcConfig::default();
        let accessor = GraphAccessor::new(&store, &config);

        let ctx = accessor.load_context(&["fldName".into()]).await.unwrap();
        assert!(ctx.start_ids.contains(&FieldId::from("fldLink")));
        assert!(ctx
            .edges
            .contains(&FieldEdge::new("fldName", "fldLink")));
    }

    #[test_log::test(tokio::test)]
    async fn test_validate_references_rejects_cycles() {
        let mut store = linked_tables();
        store.add_field(formula_field("fldF1", "tblA", "{fldTitle}"));
        store.add_field(formula_field("fldF2", "tblA", "{fldF1}"));
        let config = CalcConfig::default();
        let accessor = GraphAccessor::new(&store, &config);

        // fldF1 <- fldF2 would close a loop.
        let err = accessor
            .validate_references(&"fldF1".into(), &["fldF2".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CalcError::SchemaCycle { .. }));

        // Self reference.
        assert!(accessor
            .validate_references(&"fldF1".into(), &["fldF1".into()])
            .await
            .is_err());

        // Re-pointing fldF2 at a plain field is fine.
        accessor
            .validate_references(&"fldF2".into(), &["fldTitle".into()])
            .await
            .unwrap();

        let candidate = Field::new(
            "fldF3",
            "tblA",
            FieldKind::Formula(FormulaOptions {
                expression: "{fldF2} + {fldLookup}".to_string(),
                timezone: None,
            }),
        );
        accessor
            .validate_references(&candidate.id, &candidate.dependency_field_ids())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_plan_affected_fields() {
        let mut store = linked_tables();
        store.add_field(formula_field("fldDouble", "tblA", "{fldLookup} * 2"));
        let config = CalcConfig::default();
        let accessor = GraphAccessor::new(&store, &config);

        let plan = accessor
            .plan_affected_fields(&"fldValue".into())
            .await
            .unwrap();
        assert_eq!(plan[0].as_str(), "fldValue");
        let lookup = plan.iter().position(|id| id.as_str() == "fldLookup").unwrap();
        let double = plan.iter().position(|id| id.as_str() == "fldDouble").unwrap();
        assert!(lookup < double);
        assert!(!plan.iter().any(|id| id.as_str() == "fldName"));
    }
}
