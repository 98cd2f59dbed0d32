//! Field value calculation.
//!
//! [`calculate_field`] maps a field definition, the target record and the foreign records that
//! feed it onto the field's new cell value. It performs no I/O: the engine hands in everything it
//! needs. Errors of kind [`CalcError::CellEvaluation`] are per-cell and recoverable; any other
//! error means the field's metadata is unusable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::{collections::BTreeSet, str::FromStr};

use crate::{
    error::CalcError,
    properties::{
        cell_to_string, CellValue, Field, FieldKind, FieldMap, LinkCellItem, LinkOptions, Record,
        RecordId, UserId, UserMap,
    },
    query::Evaluator,
};

/// Shared, read-only inputs of a calculation pass.
pub struct CalcInputs<'a, E: Evaluator + ?Sized> {
    pub fields: &'a FieldMap,
    pub evaluator: &'a E,
    pub users: Option<&'a UserMap>,
    /// Used for formulas that do not carry their own timezone.
    pub default_timezone: &'a str,
}

/// New value of `field` on `record`.
///
/// `sources` are the foreign records linked to `record` through `field`'s link (after filtering),
/// in foreign-key host order. They are ignored by fields that do not read through a link.
pub fn calculate_field<E: Evaluator + ?Sized>(
    inputs: &CalcInputs<'_, E>,
    field: &Field,
    record: &Record,
    sources: &[&Record],
) -> Result<Option<CellValue>, CalcError> {
    match &field.kind {
        FieldKind::Plain => Ok(record.get(&field.id).cloned()),
        FieldKind::Lookup(_) => {
            if field.has_error {
                return Ok(None);
            }
            require_looked_up(inputs.fields, field)?;
            if is_multiple(field) {
                Ok(lookup_value(looked_up_values(field, record, sources)))
            } else {
                Ok(single_value(field, record, sources))
            }
        }
        FieldKind::Rollup(options) => {
            if field.has_error {
                return Ok(None);
            }
            require_looked_up(inputs.fields, field)?;
            let function = RollupFunction::parse_expression(&options.expression)
                .map_err(|e| cell_error(field, record, e.to_string()))?;
            let values = looked_up_values(field, record, sources);
            Ok(function.apply(&values))
        }
        FieldKind::Link(options) => {
            require_looked_up(inputs.fields, field)?;
            link_value(field, options, record, sources)
        }
        FieldKind::Formula(options) => {
            if field.has_error {
                return Ok(None);
            }
            let timezone = options
                .timezone
                .as_deref()
                .unwrap_or(inputs.default_timezone);
            inputs
                .evaluator
                .evaluate(&options.expression, inputs.fields, record, Some(timezone))
                .map(|value| value.filter(|v| !v.is_null()))
                .map_err(|e| cell_error(field, record, format!("`{}`: {e}", options.expression)))
        }
        FieldKind::CreatedTime => Ok(record.created_time.clone().map(CellValue::String)),
        FieldKind::LastModifiedTime => Ok(record.last_modified_time.clone().map(CellValue::String)),
        FieldKind::AutoNumber => Ok(record.auto_number.map(|n| json!(n))),
        FieldKind::CreatedBy => Ok(user_value(inputs.users, field, record, &record.created_by)),
        FieldKind::LastModifiedBy => Ok(user_value(
            inputs.users,
            field,
            record,
            &record.last_modified_by,
        )),
    }
}

fn cell_error(field: &Field, record: &Record, message: String) -> CalcError {
    CalcError::CellEvaluation {
        field_id: field.id.clone(),
        record_id: record.id.clone(),
        message,
    }
}

fn require_looked_up(fields: &FieldMap, field: &Field) -> Result<(), CalcError> {
    let looked_up = field.looked_up_field_id().ok_or_else(|| {
        CalcError::DependencyResolution(format!("field {} has no looked-up field", field.id))
    })?;
    if fields.contains_key(looked_up) {
        Ok(())
    } else {
        Err(CalcError::DependencyResolution(format!(
            "looked-up field {looked_up} of {} is not loaded",
            field.id
        )))
    }
}

fn is_multiple(field: &Field) -> bool {
    field.relationship().is_some_and(|r| r.is_multiple())
}

/// Sources ordered by the record's own link cell. Sources missing from the cell do not
/// contribute.
fn ordered_sources<'r>(field: &Field, record: &Record, sources: &[&'r Record]) -> Vec<&'r Record> {
    let Some(link_id) = field.link_field_id() else {
        return vec![];
    };
    LinkCellItem::parse_cell(record.get(link_id))
        .into_iter()
        .filter_map(|item| sources.iter().find(|src| src.id == item.id).copied())
        .collect()
}

/// Looked-up values across the linked records, list cells flattened one level. Missing values are
/// kept as nulls so that aggregates can count records.
fn looked_up_values(field: &Field, record: &Record, sources: &[&Record]) -> Vec<CellValue> {
    let Some(looked_up) = field.looked_up_field_id() else {
        return vec![];
    };
    let mut ordered = ordered_sources(field, record, sources);
    if !is_multiple(field) {
        ordered.truncate(1);
    }
    let mut values = Vec::new();
    for source in ordered {
        match source.get(looked_up) {
            Some(CellValue::Array(items)) => values.extend(items.iter().cloned()),
            Some(value) => values.push(value.clone()),
            None => values.push(CellValue::Null),
        }
    }
    values
}

fn lookup_value(values: Vec<CellValue>) -> Option<CellValue> {
    let values: Vec<CellValue> = values.into_iter().filter(|v| !v.is_null()).collect();
    if values.is_empty() {
        None
    } else {
        Some(CellValue::Array(values))
    }
}

/// The looked-up value of the one linked record, unchanged.
fn single_value(field: &Field, record: &Record, sources: &[&Record]) -> Option<CellValue> {
    let looked_up = field.looked_up_field_id()?;
    ordered_sources(field, record, sources)
        .first()?
        .get(looked_up)
        .filter(|v| !v.is_null())
        .cloned()
}

/// Keeps the stored reference order for records that are still linked, appends newly linked
/// records, and re-renders every title from the foreign looked-up field.
fn link_value(
    field: &Field,
    options: &LinkOptions,
    record: &Record,
    sources: &[&Record],
) -> Result<Option<CellValue>, CalcError> {
    let title = |source: &Record| {
        source
            .get(&options.lookup_field_id)
            .map(cell_to_string)
            .filter(|t| !t.is_empty())
    };
    let mut items: Vec<LinkCellItem> = Vec::new();
    let mut seen: BTreeSet<RecordId> = BTreeSet::new();
    for stored in LinkCellItem::parse_cell(record.get(&field.id)) {
        if let Some(source) = sources.iter().find(|src| src.id == stored.id) {
            if seen.insert(stored.id.clone()) {
                items.push(LinkCellItem {
                    id: stored.id,
                    title: title(source),
                });
            }
        }
    }
    for source in sources {
        if seen.insert(source.id.clone()) {
            items.push(LinkCellItem {
                id: source.id.clone(),
                title: title(source),
            });
        }
    }

    if options.relationship.is_multiple() {
        Ok(Some(serde_json::to_value(&items)?))
    } else {
        items
            .into_iter()
            .next()
            .map(|item| serde_json::to_value(&item))
            .transpose()
            .map_err(CalcError::from)
    }
}

fn user_value(
    users: Option<&UserMap>,
    field: &Field,
    record: &Record,
    user_id: &Option<UserId>,
) -> Option<CellValue> {
    let user_id = user_id.as_ref()?;
    if let Some(user) = users.and_then(|users| users.get(user_id)) {
        let mut value = json!({"id": user.id, "title": user.name});
        if let Some(email) = &user.email {
            value["email"] = json!(email);
        }
        return Some(value);
    }
    match record.get(&field.id) {
        Some(stored) if stored.get("id").and_then(|id| id.as_str()) == Some(user_id.as_str()) => {
            Some(stored.clone())
        }
        _ => Some(json!({"id": user_id})),
    }
}

/// Aggregates a rollup applies to its looked-up values, written `name({values})`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupFunction {
    CountAll,
    CountA,
    Count,
    Sum,
    Average,
    Max,
    Min,
    And,
    Or,
    Xor,
    ArrayJoin,
    ArrayUnique,
    ArrayCompact,
    Concatenate,
}

static ROLLUP_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_]+)\s*\(\s*\{values\}\s*\)\s*$").expect("static regex is valid")
});

impl FromStr for RollupFunction {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "countall" => RollupFunction::CountAll,
            "counta" => RollupFunction::CountA,
            "count" => RollupFunction::Count,
            "sum" => RollupFunction::Sum,
            "average" => RollupFunction::Average,
            "max" => RollupFunction::Max,
            "min" => RollupFunction::Min,
            "and" => RollupFunction::And,
            "or" => RollupFunction::Or,
            "xor" => RollupFunction::Xor,
            "array_join" => RollupFunction::ArrayJoin,
            "array_unique" => RollupFunction::ArrayUnique,
            "array_compact" => RollupFunction::ArrayCompact,
            "concatenate" => RollupFunction::Concatenate,
            other => {
                return Err(CalcError::Evaluation(format!(
                    "unknown rollup function '{other}'"
                )))
            }
        })
    }
}

impl RollupFunction {
    pub fn parse_expression(expression: &str) -> Result<RollupFunction, CalcError> {
        let name = ROLLUP_EXPRESSION
            .captures(expression)
            .and_then(|cap| cap.get(1))
            .ok_or_else(|| {
                CalcError::Evaluation(format!("malformed rollup expression '{expression}'"))
            })?;
        name.as_str().parse()
    }

    /// Applies the aggregate. Empty input yields the typed empty aggregate: zero for counts and
    /// sums, `false` for boolean folds, `""` for joins, `[]` for arrays, and no value for
    /// averages and extrema.
    pub fn apply(&self, values: &[CellValue]) -> Option<CellValue> {
        let present = || values.iter().filter(|v| !is_blank(v));
        let numbers = || values.iter().filter_map(|v| v.as_f64());
        match self {
            RollupFunction::CountAll => Some(json!(values.len())),
            RollupFunction::CountA => Some(json!(present().count())),
            RollupFunction::Count => Some(json!(numbers().count())),
            RollupFunction::Sum => number(numbers().sum()),
            RollupFunction::Average => {
                let count = numbers().count();
                (count > 0).then(|| numbers().sum::<f64>() / count as f64).and_then(number)
            }
            RollupFunction::Max => numbers().reduce(f64::max).and_then(number),
            RollupFunction::Min => numbers().reduce(f64::min).and_then(number),
            RollupFunction::And => Some(json!(
                !values.is_empty() && values.iter().all(is_truthy)
            )),
            RollupFunction::Or => Some(json!(values.iter().any(is_truthy))),
            RollupFunction::Xor => Some(json!(
                values.iter().filter(|v| is_truthy(v)).count() % 2 == 1
            )),
            RollupFunction::ArrayJoin => Some(json!(present()
                .map(cell_to_string)
                .collect::<Vec<String>>()
                .join(", "))),
            RollupFunction::Concatenate => Some(json!(present()
                .map(cell_to_string)
                .collect::<Vec<String>>()
                .concat())),
            RollupFunction::ArrayUnique => {
                let mut unique: Vec<CellValue> = Vec::new();
                for value in values.iter().filter(|v| !v.is_null()) {
                    if !unique.contains(value) {
                        unique.push(value.clone());
                    }
                }
                Some(CellValue::Array(unique))
            }
            RollupFunction::ArrayCompact => {
                Some(CellValue::Array(present().cloned().collect()))
            }
        }
    }
}

fn is_blank(value: &CellValue) -> bool {
    match value {
        CellValue::Null => true,
        CellValue::String(s) => s.is_empty(),
        CellValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &CellValue) -> bool {
    match value {
        CellValue::Null => false,
        CellValue::Bool(b) => *b,
        CellValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        CellValue::String(s) => !s.is_empty(),
        CellValue::Array(items) => !items.is_empty(),
        CellValue::Object(_) => true,
    }
}

/// Integral results are stored as integers.
pub(crate) fn number(value: f64) -> Option<CellValue> {
    if !value.is_finite() {
        return None;
    }
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        return Some(json!(value as i64));
    }
    serde_json::Number::from_f64(value).map(CellValue::Number)
}
