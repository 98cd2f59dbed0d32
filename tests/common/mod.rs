//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use recalc_core::{
    error::CalcError,
    properties::{
        CellValue, Field, FieldKind, FieldMap, FormulaOptions, LinkOptions, LookupOptions, Record,
        Relationship, RollupOptions,
    },
    query::Evaluator,
};
use serde_json::json;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[allow(dead_code)]
pub fn plain_field(id: &str, table_id: &str) -> Field {
    Field::new(id, table_id, FieldKind::Plain)
}

#[allow(dead_code)]
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

/// A link whose pairs live in `fk_<id>(self_id, foreign_id)`.
#[allow(dead_code)]
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

/// The reverse side of `link`: same host table, key columns swapped.
#[allow(dead_code)]
pub fn symmetric_pair(link: Field, back_id: &str, back_lookup_field_id: &str) -> (Field, Field) {
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

#[allow(dead_code)]
fn lookup_options(link: &Field, looked_up_field_id: &str) -> LookupOptions {
    let options = link.link_options().unwrap();
    LookupOptions {
        link_field_id: link.id.clone(),
        lookup_field_id: looked_up_field_id.into(),
        foreign_table_id: options.foreign_table_id.clone(),
        relationship: options.relationship,
        filter: None,
    }
}

#[allow(dead_code)]
pub fn lookup_field(id: &str, table_id: &str, link: &Field, looked_up_field_id: &str) -> Field {
    Field::new(
        id,
        table_id,
        FieldKind::Lookup(lookup_options(link, looked_up_field_id)),
    )
}

#[allow(dead_code)]
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

#[allow(dead_code)]
pub fn record(id: &str, cells: &[(&str, CellValue)]) -> Record {
    cells
        .iter()
        .fold(Record::new(id), |record, (field, value)| {
            record.with_cell(*field, value.clone())
        })
}

/// `<operand>` or `<operand> <op> <operand>` over number literals and `{fieldId}` references.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticEvaluator;

#[allow(dead_code)]
fn operand(token: &str, record: &Record) -> Result<Option<f64>, CalcError> {
    match token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        Some(id) => match record.get(&id.into()) {
            None => Ok(None),
            Some(CellValue::Array(items)) if items.len() == 1 => Ok(items[0].as_f64()),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| CalcError::Evaluation(format!("{id} is not a number"))),
        },
        None => token
            .parse::<f64>()
            .map(Some)
            .map_err(|e| CalcError::Evaluation(e.to_string())),
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
        let result = match tokens.as_slice() {
            [single] => operand(single, record)?,
            [lhs, op, rhs] => match (operand(lhs, record)?, operand(rhs, record)?) {
                (Some(lhs), Some(rhs)) => Some(match *op {
                    "+" => lhs + rhs,
                    "-" => lhs - rhs,
                    "*" => lhs * rhs,
                    "/" if rhs == 0.0 => {
                        return Err(CalcError::Evaluation("division by zero".to_string()))
                    }
                    "/" => lhs / rhs,
                    other => return Err(CalcError::Evaluation(format!("unknown operator {other}"))),
                }),
                _ => None,
            },
            _ => return Err(CalcError::Evaluation(format!("cannot evaluate {expression:?}"))),
        };
        Ok(result.map(|n| {
            if n.fract() == 0.0 {
                json!(n as i64)
            } else {
                json!(n)
            }
        }))
    }
}
