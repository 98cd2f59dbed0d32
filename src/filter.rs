//! Record-level filters carried by lookup and rollup fields.
//!
//! A filter is a nested and/or group of conditions evaluated against a foreign record. Only
//! records that pass contribute to the lookup value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::properties::{cell_to_string, CellValue, FieldId, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsGreater,
    IsGreaterEqual,
    IsLess,
    IsLessEqual,
    IsEmpty,
    IsNotEmpty,
    IsAnyOf,
    IsNoneOf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub field_id: FieldId,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CellValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
    #[serde(default)]
    pub conjunction: Conjunction,
    pub filter_set: Vec<RecordFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordFilter {
    Group(FilterGroup),
    Condition(FilterCondition),
}

impl RecordFilter {
    pub fn condition<F: Into<FieldId>>(
        field_id: F,
        operator: FilterOperator,
        value: Option<CellValue>,
    ) -> RecordFilter {
        RecordFilter::Condition(FilterCondition {
            field_id: field_id.into(),
            operator,
            value,
        })
    }

    pub fn and(filter_set: Vec<RecordFilter>) -> RecordFilter {
        RecordFilter::Group(FilterGroup {
            conjunction: Conjunction::And,
            filter_set,
        })
    }

    pub fn or(filter_set: Vec<RecordFilter>) -> RecordFilter {
        RecordFilter::Group(FilterGroup {
            conjunction: Conjunction::Or,
            filter_set,
        })
    }

    /// Every field id the filter reads.
    pub fn field_ids(&self) -> BTreeSet<FieldId> {
        let mut ids = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(filter) = stack.pop() {
            match filter {
                RecordFilter::Condition(cond) => {
                    ids.insert(cond.field_id.clone());
                }
                RecordFilter::Group(group) => stack.extend(group.filter_set.iter()),
            }
        }
        ids
    }

    /// An empty group matches everything.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RecordFilter::Condition(cond) => cond.matches(record),
            RecordFilter::Group(group) => match group.conjunction {
                Conjunction::And => group.filter_set.iter().all(|f| f.matches(record)),
                Conjunction::Or => {
                    group.filter_set.is_empty() || group.filter_set.iter().any(|f| f.matches(record))
                }
            },
        }
    }
}

impl FilterCondition {
    pub fn matches(&self, record: &Record) -> bool {
        let cell = record.get(&self.field_id);
        let value = self.value.as_ref().filter(|v| !v.is_null());
        match self.operator {
            FilterOperator::IsEmpty => is_empty(cell),
            FilterOperator::IsNotEmpty => !is_empty(cell),
            FilterOperator::Is => value.is_some_and(|v| cell_equals(cell, v)),
            FilterOperator::IsNot => !value.is_some_and(|v| cell_equals(cell, v)),
            FilterOperator::Contains => value.is_some_and(|v| cell_contains(cell, v)),
            FilterOperator::DoesNotContain => !value.is_some_and(|v| cell_contains(cell, v)),
            FilterOperator::IsGreater => compare(cell, value).is_some_and(|o| o.is_gt()),
            FilterOperator::IsGreaterEqual => compare(cell, value).is_some_and(|o| o.is_ge()),
            FilterOperator::IsLess => compare(cell, value).is_some_and(|o| o.is_lt()),
            FilterOperator::IsLessEqual => compare(cell, value).is_some_and(|o| o.is_le()),
            FilterOperator::IsAnyOf => any_of(cell, value),
            FilterOperator::IsNoneOf => !any_of(cell, value),
        }
    }
}

fn is_empty(cell: Option<&CellValue>) -> bool {
    match cell {
        None => true,
        Some(CellValue::String(s)) => s.is_empty(),
        Some(CellValue::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

fn scalar_equals(cell: &CellValue, value: &CellValue) -> bool {
    if cell == value {
        return true;
    }
    match (cell, value) {
        (CellValue::Number(a), CellValue::Number(b)) => a.as_f64() == b.as_f64(),
        (CellValue::Object(_), CellValue::String(s)) => &cell_to_string(cell) == s,
        _ => false,
    }
}

/// List-shaped cells match when any element matches.
fn cell_equals(cell: Option<&CellValue>, value: &CellValue) -> bool {
    match cell {
        None => false,
        Some(CellValue::Array(items)) => items.iter().any(|item| scalar_equals(item, value)),
        Some(cell) => scalar_equals(cell, value),
    }
}

fn cell_contains(cell: Option<&CellValue>, value: &CellValue) -> bool {
    let Some(cell) = cell else {
        return false;
    };
    let needle = cell_to_string(value).to_lowercase();
    cell_to_string(cell).to_lowercase().contains(&needle)
}

fn compare(cell: Option<&CellValue>, value: Option<&CellValue>) -> Option<std::cmp::Ordering> {
    match (cell?, value?) {
        (CellValue::Number(a), CellValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (CellValue::String(a), CellValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn any_of(cell: Option<&CellValue>, value: Option<&CellValue>) -> bool {
    match value {
        Some(CellValue::Array(options)) => options.iter().any(|opt| cell_equals(cell, opt)),
        Some(single) => cell_equals(cell, single),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn record(value: CellValue) -> Record {
        Record::new("rec1").with_cell("fldV", value)
    }

    #[test]
    fn test_condition_operators() {
        let is_x = RecordFilter::condition("fldV", FilterOperator::Is, Some(json!("X")));
        let is_not_x = RecordFilter::condition("fldV", FilterOperator::IsNot, Some(json!("X")));
        assert!(is_x.matches(&record(json!("X"))));
        assert!(!is_not_x.matches(&record(json!("X"))));
        assert!(is_not_x.matches(&record(json!("Y"))));
        assert!(is_not_x.matches(&Record::new("empty")));

        let gt = RecordFilter::condition("fldV", FilterOperator::IsGreater, Some(json!(10)));
        assert!(gt.matches(&record(json!(10.5))));
        assert!(!gt.matches(&record(json!(10))));
        assert!(!gt.matches(&record(json!("11"))));

        let contains = RecordFilter::condition("fldV", FilterOperator::Contains, Some(json!("ell")));
        assert!(contains.matches(&record(json!("Hello"))));

        let empty = RecordFilter::condition("fldV", FilterOperator::IsEmpty, None);
        assert!(empty.matches(&record(json!([]))));
        assert!(!empty.matches(&record(json!(0))));

        let any = RecordFilter::condition("fldV", FilterOperator::IsAnyOf, Some(json!(["a", "b"])));
        assert!(any.matches(&record(json!(["c", "b"]))));
        assert!(!any.matches(&record(json!("c"))));
    }

    #[test]
    fn test_groups_and_field_ids() {
        let filter = RecordFilter::or(vec![
            RecordFilter::condition("fldV", FilterOperator::Is, Some(json!(1))),
            RecordFilter::and(vec![
                RecordFilter::condition("fldW", FilterOperator::IsNotEmpty, None),
                RecordFilter::condition("fldV", FilterOperator::IsLess, Some(json!(0))),
            ]),
        ]);
        let ids = filter.field_ids();
        assert_eq!(ids.len(), 2);

        assert!(filter.matches(&record(json!(1))));
        assert!(!filter.matches(&record(json!(-1))));
        assert!(filter.matches(&record(json!(-1)).with_cell("fldW", json!("w"))));
        assert!(RecordFilter::and(vec![]).matches(&record(json!(5))));
    }

    #[test]
    fn test_filter_serde_untagged() {
        let raw = json!({
            "conjunction": "and",
            "filterSet": [{"fieldId": "fldV", "operator": "isNot", "value": "X"}]
        });
        let filter: RecordFilter = serde_json::from_value(raw).unwrap();
        assert!(matches!(filter, RecordFilter::Group(_)));
        assert!(filter.matches(&record(json!("Y"))));
    }
}
