//! Shared test utilities: field builders, a two-table fixture and a small arithmetic evaluator

use crate::{
    calc::number,
    error::CalcError,
    memory::MemoryStore,
    properties::{
        CellValue, Field, FieldKind, FieldMap, FormulaOptions, LinkOptions, LookupOptions, Record,
        Relationship, RollupOptions,
    },
    query::Evaluator,
};
use serde_json::json;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn plain_field(id: &str, table_id: &str) -> Field {
    Field::new(id, table_id, FieldKind::Plain)
}

pub fn formula_field(id: &str, table_id: &str, expression: &str) -> Field {
    Field::new(
        id,
        table_id,
        FieldKind::Formula(FormulaOptions {
            expression: expression.to_string(),
            timezone: None,
        }),
    )
}

/// A link hosted in its own junction table `fk_<id>` with `self_id`/`foreign_id` columns.
pub fn link_field(
    id: &str,
    table_id: &str,
    foreign_table_id: &str,
    lookup_field_id: &str,
    relationship: Relationship,
) -> Field {
    Field::new(
        id,
        table_id,
        FieldKind::Link(LinkOptions {
            relationship,
            foreign_table_id: foreign_table_id.into(),
            lookup_field_id: lookup_field_id.into(),
            fk_host_table_name: format!("fk_{id}"),
            self_key_name: "self_id".to_string(),
            foreign_key_name: "foreign_id".to_string(),
            symmetric_field_id: None,
        }),
    )
}

/// Pairs `link` with a reverse link `back_id` sharing its junction table, columns swapped.
pub fn symmetric(link: Field, back_id: &str, back_lookup_field_id: &str) -> (Field, Field) {
    let mut link = link;
    let FieldKind::Link(options) = &mut link.kind else {
        panic!("{} is not a link", link.id);
    };
    options.symmetric_field_id = Some(back_id.into());
    let back = Field::new(
        back_id,
        options.foreign_table_id.clone(),
        FieldKind::Link(LinkOptions {
            relationship: options.relationship.reverse(),
            foreign_table_id: link.table_id.clone(),
            lookup_field_id: back_lookup_field_id.into(),
            fk_host_table_name: options.fk_host_table_name.clone(),
            self_key_name: options.foreign_key_name.clone(),
            foreign_key_name: options.self_key_name.clone(),
            symmetric_field_id: Some(link.id.clone()),
        }),
    );
    (link, back)
}

fn lookup_options(link: &Field, looked_up_field_id: &str) -> LookupOptions {
    let options = link.link_options().expect("lookups read through a link field");
    LookupOptions {
        link_field_id: link.id.clone(),
        lookup_field_id: looked_up_field_id.into(),
        foreign_table_id: options.foreign_table_id.clone(),
        relationship: options.relationship,
        filter: None,
    }
}

pub fn lookup_field(id: &str, table_id: &str, link: &Field, looked_up_field_id: &str) -> Field {
    Field::new(
        id,
        table_id,
        FieldKind::Lookup(lookup_options(link, looked_up_field_id)),
    )
}

pub fn rollup_field(
    id: &str,
    table_id: &str,
    link: &Field,
    looked_up_field_id: &str,
    expression: &str,
) -> Field {
    Field::new(
        id,
        table_id,
        FieldKind::Rollup(RollupOptions {
            lookup_options: lookup_options(link, looked_up_field_id),
            expression: expression.to_string(),
        }),
    )
}

/// Two tables joined by a symmetric many-many link.
///
/// ```text
/// tblA: fldTitle (primary), fldLink -> tblB, fldLookup = fldLink.fldValue
///       a1 -> [b1, b2], a2 -> [b2], a3 unlinked
/// tblB: fldName (primary), fldValue, fldBack -> tblA
///       b1 = 10, b2 = 20, b3 = 30
/// ```
///
/// Stored computed cells are consistent with the links, so a pass over unchanged data is a no-op.
pub fn linked_tables() -> MemoryStore {
    init_logging();
    let mut store = MemoryStore::new();
    store.add_table("tblA", "table_a");
    store.add_table("tblB", "table_b");

    store.add_field(plain_field("fldTitle", "tblA").primary());
    store.add_field(plain_field("fldName", "tblB").primary());
    store.add_field(plain_field("fldValue", "tblB"));
    let (link, back) = symmetric(
        link_field("fldLink", "tblA", "tblB", "fldName", Relationship::ManyMany),
        "fldBack",
        "fldTitle",
    );
    store.add_field(lookup_field("fldLookup", "tblA", &link, "fldValue"));
    store.add_field(link);
    store.add_field(back);

    for (id, title) in [("a1", "A1"), ("a2", "A2"), ("a3", "A3")] {
        store.insert_record("tblA", Record::new(id).with_cell("fldTitle", json!(title)));
    }
    for (id, name, value) in [("b1", "B1", 10), ("b2", "B2", 20), ("b3", "B3", 30)] {
        store.insert_record(
            "tblB",
            Record::new(id)
                .with_cell("fldName", json!(name))
                .with_cell("fldValue", json!(value)),
        );
    }
    let link_id = "fldLink".into();
    for (a, b) in [("a1", "b1"), ("a1", "b2"), ("a2", "b2")] {
        store.link(&link_id, a, b).expect("fixture link field exists");
    }

    store.set_cell(
        "tblA",
        "a1",
        "fldLink",
        Some(json!([{"id": "b1", "title": "B1"}, {"id": "b2", "title": "B2"}])),
    );
    store.set_cell("tblA", "a2", "fldLink", Some(json!([{"id": "b2", "title": "B2"}])));
    store.set_cell("tblA", "a3", "fldLink", Some(json!([])));
    store.set_cell("tblA", "a1", "fldLookup", Some(json!([10, 20])));
    store.set_cell("tblA", "a2", "fldLookup", Some(json!([20])));
    store.set_cell("tblB", "b1", "fldBack", Some(json!([{"id": "a1", "title": "A1"}])));
    store.set_cell(
        "tblB",
        "b2",
        "fldBack",
        Some(json!([{"id": "a1", "title": "A1"}, {"id": "a2", "title": "A2"}])),
    );
    store.set_cell("tblB", "b3", "fldBack", Some(json!([])));
    store
}

/// Evaluates `<operand>` or `<operand> <op> <operand>` with `+ - * /`, where an operand is a
/// number literal or a `{fieldId}` reference. A missing operand yields an empty result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticEvaluator;

impl ArithmeticEvaluator {
    fn operand(token: &str, record: &Record) -> Result<Option<f64>, CalcError> {
        let token = token.trim();
        if let Some(id) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            let value = match record.get(&id.into()) {
                None => return Ok(None),
                Some(CellValue::Array(items)) if items.len() == 1 => items[0].clone(),
                Some(value) => value.clone(),
            };
            return value
                .as_f64()
                .map(Some)
                .ok_or_else(|| CalcError::Evaluation(format!("{{{id}}} is not a number: {value}")));
        }
        token
            .parse::<f64>()
            .map(Some)
            .map_err(|e| CalcError::Evaluation(format!("bad operand {token:?}: {e}")))
    }
}

impl Evaluator for ArithmeticEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        _fields: &FieldMap,
        record: &Record,
        _timezone: Option<&str>,
    ) -> Result<Option<CellValue>, CalcError> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        match tokens.as_slice() {
            [single] => Ok(Self::operand(single, record)?.and_then(number)),
            [lhs, op, rhs] => {
                let (Some(lhs), Some(rhs)) =
                    (Self::operand(lhs, record)?, Self::operand(rhs, record)?)
                else {
                    return Ok(None);
                };
                let result = match *op {
                    "+" => lhs + rhs,
                    "-" => lhs - rhs,
                    "*" => lhs * rhs,
                    "/" if rhs == 0.0 => {
                        return Err(CalcError::Evaluation("division by zero".to_string()))
                    }
                    "/" => lhs / rhs,
                    other => {
                        return Err(CalcError::Evaluation(format!("unknown operator {other}")))
                    }
                };
                Ok(number(result))
            }
            _ => Err(CalcError::Evaluation(format!(
                "cannot evaluate {expression:?}"
            ))),
        }
    }
}
