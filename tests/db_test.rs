//! Integration tests for the SQLite adapter: schema storage, reference edges, fk hosts and
//! applying a calculation result.
#![cfg(feature = "service")]

mod common;

use common::{formula_field, init_logging, link_field, lookup_field, plain_field, record, ArithmeticEvaluator};
use recalc_core::{
    config::CalcConfig,
    db::{db_init, DbConnection, Transaction},
    engine::{CalcRequest, CalcSeed, ReferenceEngine},
    filter::{FilterOperator, RecordFilter},
    properties::{FieldId, FieldKind, Record, RecordId, Relationship, TableId},
    query::{CalcSource, KeySide},
    topo::FieldEdge,
};
use serde_json::json;
use tempfile::TempDir;

async fn seeded_db(temp_dir: &TempDir) -> DbConnection {
    init_logging();
    let pool = db_init(temp_dir.path().join("recalc.db")).await.unwrap();
    let db = DbConnection(pool);

    let link = link_field("fldLink", "tblA", "tblB", "fldName", Relationship::OneMany);
    let fk = link.link_options().unwrap().foreign_key_ref();
    let mut tx = Transaction::new();
    tx.add_table(&"tblA".into(), "table_a");
    tx.add_table(&"tblB".into(), "table_b");
    for field in [
        plain_field("fldTitle", "tblA").primary(),
        plain_field("fldName", "tblB").primary(),
        plain_field("fldValue", "tblB"),
        lookup_field("fldLookup", "tblA", &link, "fldValue"),
        formula_field("fldTwice", "tblA", "{fldLookup} * 2"),
        link,
    ] {
        tx.add_field(&field).unwrap();
    }
    let table_a = TableId::from("tblA");
    let table_b = TableId::from("tblB");
    tx.add_record(&table_a, &record("a1", &[("fldTitle", json!("A1"))]))
        .unwrap();
    tx.add_record(&table_a, &record("a2", &[("fldTitle", json!("A2"))]))
        .unwrap();
    tx.add_record(
        &table_b,
        &record("b1", &[("fldName", json!("B1")), ("fldValue", json!(10))]),
    )
    .unwrap();
    tx.add_record(
        &table_b,
        &record("b2", &[("fldName", json!("B2")), ("fldValue", json!(20))]),
    )
    .unwrap();
    tx.create_fk_host(&fk);
    tx.link(&fk, &"a1".into(), &"b1".into());
    tx.link(&fk, &"a1".into(), &"b2".into());
    tx.execute(&db.0).await.unwrap();
    db
}

#[test_log::test(tokio::test)]
async fn test_reference_rows_follow_field_definitions() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded_db(&temp_dir).await;

    let edges = db.reachable_edges(&["fldValue".into()]).await.unwrap();
    for edge in [
        FieldEdge::new("fldValue", "fldLookup"),
        FieldEdge::new("fldLink", "fldLookup"),
        FieldEdge::new("fldName", "fldLink"),
        FieldEdge::new("fldLookup", "fldTwice"),
    ] {
        assert!(edges.contains(&edge), "missing {edge:?}");
    }

    // Redefining a field replaces its incoming edges.
    let mut tx = Transaction::new();
    tx.add_field(&formula_field("fldTwice", "tblA", "{fldTitle} * 2"))
        .unwrap();
    tx.execute(&db.0).await.unwrap();
    let edges = db.reachable_edges(&["fldTwice".into()]).await.unwrap();
    assert_eq!(edges, vec![FieldEdge::new("fldTitle", "fldTwice")]);

    // Fields read by a lookup filter become dependencies too.
    let link = db.fields(&["fldLink".into()]).await.unwrap().remove(0);
    let mut filtered = lookup_field("fldFiltered", "tblA", &link, "fldValue");
    if let FieldKind::Lookup(options) = &mut filtered.kind {
        options.filter = Some(RecordFilter::condition(
            "fldStatus",
            FilterOperator::IsNot,
            Some(json!("hidden")),
        ));
    }
    let mut tx = Transaction::new();
    tx.add_field(&plain_field("fldStatus", "tblB")).unwrap();
    tx.add_field(&filtered).unwrap();
    tx.execute(&db.0).await.unwrap();
    let edges = db.reachable_edges(&["fldStatus".into()]).await.unwrap();
    assert!(edges.contains(&FieldEdge::new("fldStatus", "fldFiltered")));

    let links = db
        .link_fields_by_lookup_field(&["fldName".into()])
        .await
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].id, FieldId::from("fldLink"));

    let names = db.db_table_names(&["tblA".into(), "tblX".into()]).await.unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(names[&TableId::from("tblA")], "table_a");
}

#[test_log::test(tokio::test)]
async fn test_fk_pairs_and_record_paging() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded_db(&temp_dir).await;
    let link = db.fields(&["fldLink".into()]).await.unwrap().remove(0);
    let fk = link.link_options().unwrap().foreign_key_ref();

    let pairs = db
        .fk_pairs(&fk, KeySide::ForeignKey, &["b2".into()])
        .await
        .unwrap();
    assert_eq!(pairs, vec![(RecordId::from("a1"), RecordId::from("b2"))]);
    let pairs = db
        .fk_pairs(&fk, KeySide::SelfKey, &["a1".into(), "a2".into()])
        .await
        .unwrap();
    assert_eq!(pairs.len(), 2);

    let table_a = TableId::from("tblA");
    assert_eq!(db.record_ids(&table_a, 0, 1).await.unwrap(), vec![RecordId::from("a1")]);
    assert_eq!(db.record_ids(&table_a, 1, 5).await.unwrap(), vec![RecordId::from("a2")]);

    let records: Vec<Record> = db
        .records(&table_a, &["a2".into(), "a1".into(), "a9".into()])
        .await
        .unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a2", "a1"]);
}

#[test_log::test(tokio::test)]
async fn test_calculation_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let db = seeded_db(&temp_dir).await;
    let engine = ReferenceEngine::new(db, ArithmeticEvaluator, CalcConfig::default());

    let report = engine
        .calculate(CalcRequest::new(vec![CalcSeed::new("fldLink", ["a1", "a2"])]))
        .await
        .unwrap();
    engine.source().apply(&report.change_set()).await.unwrap();

    let table_a = TableId::from("tblA");
    let stored = engine.source().records(&table_a, &["a1".into()]).await.unwrap();
    assert_eq!(stored[0].get(&"fldLookup".into()), Some(&json!([10, 20])));
    assert_eq!(
        stored[0].get(&"fldLink".into()),
        Some(&json!([{"id": "b1", "title": "B1"}, {"id": "b2", "title": "B2"}]))
    );

    // A value cleared by a later pass is removed from the stored cells.
    let mut tx = Transaction::new();
    let fk = link_field("fldLink", "tblA", "tblB", "fldName", Relationship::OneMany)
        .link_options()
        .unwrap()
        .foreign_key_ref();
    tx.unlink(&fk, &"a1".into(), &"b1".into());
    tx.unlink(&fk, &"a1".into(), &"b2".into());
    tx.execute(&engine.source().0).await.unwrap();
    let report = engine
        .calculate(CalcRequest::new(vec![CalcSeed::new("fldLink", ["a1"])]))
        .await
        .unwrap();
    engine.source().apply(&report.change_set()).await.unwrap();
    let stored = engine.source().records(&table_a, &["a1".into()]).await.unwrap();
    assert_eq!(stored[0].get(&"fldLookup".into()), None);
    assert_eq!(stored[0].get(&"fldTwice".into()), None);

    let again = engine
        .calculate(CalcRequest::new(vec![CalcSeed::new("fldLink", ["a1"])]))
        .await
        .unwrap();
    assert!(again.is_noop());
}
