//! Data model shared by every stage of a calculation pass.
//!
//! Fields are a closed variant ([`FieldKind`]) so the calculator can match exhaustively. Cell
//! values are plain JSON ([`CellValue`]); structural equality on them is what decides whether a
//! recomputed value is a change.

use enumset::{EnumSet, EnumSetType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

#[cfg(feature = "service")]
use sqlx::{sqlite::SqliteRow, FromRow, Row};

#[cfg(feature = "service")]
use crate::error::CalcError;
use crate::{filter::RecordFilter, query::ForeignKeyRef};

pub type CellValue = serde_json::Value;

pub type UserId = String;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<&$name> for $name {
            fn from(id: &$name) -> Self {
                id.clone()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Column identifier, unique across all tables.
    FieldId
);
string_id!(
    /// Logical table identifier (not the physical table name).
    TableId
);
string_id!(
    /// Row identifier, stable for the lifetime of the record.
    RecordId
);

pub type FieldMap = BTreeMap<FieldId, Field>;

/// Link cardinality, always expressed from the perspective of the field that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    OneOne,
    OneMany,
    ManyOne,
    ManyMany,
}

impl Relationship {
    /// True when one record on this side can reference many records on the other side.
    pub fn is_multiple(&self) -> bool {
        matches!(self, Relationship::OneMany | Relationship::ManyMany)
    }

    /// The same relationship seen from the symmetric field.
    pub fn reverse(&self) -> Relationship {
        match self {
            Relationship::OneOne => Relationship::OneOne,
            Relationship::OneMany => Relationship::ManyOne,
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::ManyMany => Relationship::ManyMany,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    pub relationship: Relationship,
    pub foreign_table_id: TableId,
    /// Primary field of the foreign table; its values become the link titles.
    pub lookup_field_id: FieldId,
    pub fk_host_table_name: String,
    pub self_key_name: String,
    pub foreign_key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_field_id: Option<FieldId>,
}

impl LinkOptions {
    pub fn foreign_key_ref(&self) -> ForeignKeyRef {
        ForeignKeyRef {
            host_table: self.fk_host_table_name.clone(),
            self_key: self.self_key_name.clone(),
            foreign_key: self.foreign_key_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOptions {
    pub link_field_id: FieldId,
    pub lookup_field_id: FieldId,
    pub foreign_table_id: TableId,
    pub relationship: Relationship,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RecordFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupOptions {
    pub lookup_options: LookupOptions,
    /// Aggregate written as `name({values})`, e.g. `sum({values})`.
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaOptions {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Plain type tag of a [`FieldKind`].
#[derive(Debug, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumSetType)]
pub enum FieldType {
    Plain,
    Formula,
    Rollup,
    Lookup,
    Link,
    CreatedTime,
    LastModifiedTime,
    CreatedBy,
    LastModifiedBy,
    AutoNumber,
}

impl FieldType {
    pub fn computed() -> EnumSet<FieldType> {
        EnumSet::all() - FieldType::Plain
    }

    pub fn system() -> EnumSet<FieldType> {
        FieldType::CreatedTime
            | FieldType::LastModifiedTime
            | FieldType::CreatedBy
            | FieldType::LastModifiedBy
            | FieldType::AutoNumber
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "camelCase")]
pub enum FieldKind {
    Plain,
    Formula(FormulaOptions),
    Rollup(RollupOptions),
    Lookup(LookupOptions),
    Link(LinkOptions),
    CreatedTime,
    LastModifiedTime,
    CreatedBy,
    LastModifiedBy,
    AutoNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: FieldId,
    pub table_id: TableId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub is_primary: bool,
    /// Set when the field's definition is known to be broken (e.g. an unparsable formula).
    #[serde(default)]
    pub has_error: bool,
}

static FORMULA_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("static regex is valid"));

impl Field {
    pub fn new<F: Into<FieldId>, T: Into<TableId>>(id: F, table_id: T, kind: FieldKind) -> Self {
        let id = id.into();
        Field {
            name: id.to_string(),
            id,
            table_id: table_id.into(),
            kind,
            is_primary: false,
            has_error: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn field_type(&self) -> FieldType {
        match self.kind {
            FieldKind::Plain => FieldType::Plain,
            FieldKind::Formula(_) => FieldType::Formula,
            FieldKind::Rollup(_) => FieldType::Rollup,
            FieldKind::Lookup(_) => FieldType::Lookup,
            FieldKind::Link(_) => FieldType::Link,
            FieldKind::CreatedTime => FieldType::CreatedTime,
            FieldKind::LastModifiedTime => FieldType::LastModifiedTime,
            FieldKind::CreatedBy => FieldType::CreatedBy,
            FieldKind::LastModifiedBy => FieldType::LastModifiedBy,
            FieldKind::AutoNumber => FieldType::AutoNumber,
        }
    }

    pub fn is_computed(&self) -> bool {
        FieldType::computed().contains(self.field_type())
    }

    pub fn lookup_options(&self) -> Option<&LookupOptions> {
        match &self.kind {
            FieldKind::Lookup(options) => Some(options),
            FieldKind::Rollup(options) => Some(&options.lookup_options),
            _ => None,
        }
    }

    pub fn link_options(&self) -> Option<&LinkOptions> {
        match &self.kind {
            FieldKind::Link(options) => Some(options),
            _ => None,
        }
    }

    /// True for fields whose value is read across a link (links themselves included).
    pub fn reads_through_link(&self) -> bool {
        self.lookup_options().is_some() || self.link_options().is_some()
    }

    /// The link field traversed to reach foreign records: the field itself for links.
    pub fn link_field_id(&self) -> Option<&FieldId> {
        match &self.kind {
            FieldKind::Link(_) => Some(&self.id),
            _ => self.lookup_options().map(|o| &o.link_field_id),
        }
    }

    /// The foreign field whose values flow into this one.
    pub fn looked_up_field_id(&self) -> Option<&FieldId> {
        match &self.kind {
            FieldKind::Link(options) => Some(&options.lookup_field_id),
            _ => self.lookup_options().map(|o| &o.lookup_field_id),
        }
    }

    pub fn relationship(&self) -> Option<Relationship> {
        match &self.kind {
            FieldKind::Link(options) => Some(options.relationship),
            _ => self.lookup_options().map(|o| o.relationship),
        }
    }

    pub fn filter(&self) -> Option<&RecordFilter> {
        self.lookup_options().and_then(|o| o.filter.as_ref())
    }

    /// True when `dep` is read from the foreign records: the looked-up field or a field the
    /// filter tests. The link itself lives on this field's table.
    pub fn reads_foreign_field(&self, dep: &FieldId) -> bool {
        if !self.reads_through_link() || self.link_field_id() == Some(dep) {
            return false;
        }
        self.looked_up_field_id() == Some(dep)
            || self.filter().is_some_and(|filter| filter.field_ids().contains(dep))
    }

    /// Field ids this field's value is computed from, in declaration order, without duplicates.
    pub fn dependency_field_ids(&self) -> Vec<FieldId> {
        let mut ids: Vec<FieldId> = match &self.kind {
            FieldKind::Lookup(options) => {
                vec![options.link_field_id.clone(), options.lookup_field_id.clone()]
            }
            FieldKind::Rollup(options) => vec![
                options.lookup_options.link_field_id.clone(),
                options.lookup_options.lookup_field_id.clone(),
            ],
            FieldKind::Link(options) => vec![options.lookup_field_id.clone()],
            FieldKind::Formula(options) => formula_references(&options.expression),
            _ => vec![],
        };
        if let Some(filter) = self.filter() {
            ids.extend(filter.field_ids());
        }
        let mut seen = BTreeSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }
}

/// Drops repeated items, keeping the first occurrence of each.
pub(crate) fn dedup<T: Ord + Clone, I: IntoIterator<Item = T>>(items: I) -> Vec<T> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Field ids referenced as `{fieldId}` tokens in a formula expression.
pub fn formula_references(expression: &str) -> Vec<FieldId> {
    FORMULA_REFERENCE
        .captures_iter(expression)
        .filter_map(|cap| cap.get(1).map(|m| FieldId::from(m.as_str())))
        .collect()
}

/// One entry of a link cell: the referenced record and its rendered title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCellItem {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl LinkCellItem {
    pub fn new<R: Into<RecordId>>(id: R) -> Self {
        LinkCellItem {
            id: id.into(),
            title: None,
        }
    }

    /// Reads a link cell, accepting either a single object or a list of objects.
    pub fn parse_cell(value: Option<&CellValue>) -> Vec<LinkCellItem> {
        match value {
            Some(CellValue::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            Some(obj @ CellValue::Object(_)) => serde_json::from_value(obj.clone())
                .map(|item| vec![item])
                .unwrap_or_default(),
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

pub type UserMap = BTreeMap<UserId, User>;

/// A row: cell values keyed by field id plus audit metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub cells: BTreeMap<FieldId, CellValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<UserId>,
}

impl Record {
    pub fn new<R: Into<RecordId>>(id: R) -> Self {
        Record {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_cell<F: Into<FieldId>>(mut self, field_id: F, value: CellValue) -> Self {
        self.set(&field_id.into(), Some(value));
        self
    }

    /// A stored JSON null reads as "no value".
    pub fn get(&self, field_id: &FieldId) -> Option<&CellValue> {
        self.cells.get(field_id).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, field_id: &FieldId, value: Option<CellValue>) {
        match value {
            Some(v) if !v.is_null() => {
                self.cells.insert(field_id.clone(), v);
            }
            _ => {
                self.cells.remove(field_id);
            }
        }
    }
}

/// Display projection of a cell, used for link titles and text filters.
pub fn cell_to_string(value: &CellValue) -> String {
    match value {
        CellValue::Null => String::new(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Number(n) => n.to_string(),
        CellValue::String(s) => s.clone(),
        CellValue::Array(items) => items
            .iter()
            .map(cell_to_string)
            .collect::<Vec<String>>()
            .join(", "),
        CellValue::Object(map) => map
            .get("title")
            .or_else(|| map.get("name"))
            .map(cell_to_string)
            .unwrap_or_default(),
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Field {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let definition: &str = row.try_get("definition")?;
        let field = serde_json::from_str::<Field>(definition).map_err(CalcError::from)?;
        Ok(field)
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Record {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: &str = row.try_get("id")?;
        let cells_str: &str = row.try_get("cells")?;
        let cells =
            serde_json::from_str::<BTreeMap<FieldId, CellValue>>(cells_str).map_err(CalcError::from)?;
        Ok(Record {
            id: id.into(),
            cells: cells.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            auto_number: row.try_get("auto_number")?,
            created_time: row.try_get("created_time")?,
            last_modified_time: row.try_get("last_modified_time")?,
            created_by: row.try_get("created_by")?,
            last_modified_by: row.try_get("last_modified_by")?,
        })
    }
}
