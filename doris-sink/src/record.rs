//! Records emitted by the pipeline and the column schema they are checked against.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};

/// One logical unit to be loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Opaque line, already in the wire format (a JSON document or a delimited line).
    Text(String),
    /// Typed row matching the configured [Schema].
    Structured(Row),
}

impl From<String> for Record {
    fn from(value: String) -> Self {
        Record::Text(value)
    }
}

impl From<&str> for Record {
    fn from(value: &str) -> Self {
        Record::Text(value.to_string())
    }
}

impl From<Row> for Record {
    fn from(row: Row) -> Self {
        Record::Structured(row)
    }
}

/// Change kind of a structured row, only consulted when delete support is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowKind {
    #[default]
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl RowKind {
    /// Whether the row retracts data, i.e. must carry the delete sign.
    pub fn is_retraction(self) -> bool {
        matches!(self, RowKind::Delete | RowKind::UpdateBefore)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RowValues {
    Positional(Vec<FieldValue>),
    Named(Vec<(String, FieldValue)>),
}

/// A structured row. Values are matched to the schema by position, or by name when built with
/// [Row::named].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub(crate) kind: RowKind,
    pub(crate) values: RowValues,
}

impl Row {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self {
            kind: RowKind::Insert,
            values: RowValues::Positional(values),
        }
    }

    pub fn named<K: Into<String>>(values: impl IntoIterator<Item = (K, FieldValue)>) -> Self {
        Self {
            kind: RowKind::Insert,
            values: RowValues::Named(values.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub fn with_kind(mut self, kind: RowKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> RowKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        match &self.values {
            RowValues::Positional(v) => v.len(),
            RowValues::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Column types understood by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Char,
    Varchar,
    String,
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    LargeInt,
    Float,
    Double,
    Date,
    DateTime,
}

impl FieldType {
    /// Integer width rank, `None` for non-integer types.
    fn integer_rank(self) -> Option<u8> {
        match self {
            FieldType::TinyInt => Some(0),
            FieldType::SmallInt => Some(1),
            FieldType::Int => Some(2),
            FieldType::BigInt => Some(3),
            FieldType::LargeInt => Some(4),
            _ => None,
        }
    }

    pub fn is_textual(self) -> bool {
        matches!(self, FieldType::Char | FieldType::Varchar | FieldType::String)
    }

    /// Whether a value can be written into a column of this type. Integers widen, `FLOAT` widens
    /// into `DOUBLE`, `NULL` fits anywhere.
    pub fn accepts(self, value: &FieldValue) -> bool {
        match (self, value.field_type()) {
            (_, None) => true,
            (column, Some(actual)) if column == actual => true,
            (column, Some(actual)) if column.is_textual() => actual.is_textual(),
            (FieldType::Double, Some(FieldType::Float)) => true,
            (column, Some(actual)) => match (column.integer_rank(), actual.integer_rank()) {
                (Some(c), Some(a)) => a <= c,
                _ => false,
            },
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Char => "CHAR",
            FieldType::Varchar => "VARCHAR",
            FieldType::String => "STRING",
            FieldType::Boolean => "BOOLEAN",
            FieldType::TinyInt => "TINYINT",
            FieldType::SmallInt => "SMALLINT",
            FieldType::Int => "INT",
            FieldType::BigInt => "BIGINT",
            FieldType::LargeInt => "LARGEINT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Date => "DATE",
            FieldType::DateTime => "DATETIME",
        };
        write!(f, "{name}")
    }
}

impl FromStr for FieldType {
    type Err = Error;

    /// Parses store type names, ignoring case and any `(length)` / `(precision)` suffix.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.split('(').next().unwrap_or_default().trim();
        match name.to_ascii_uppercase().as_str() {
            "CHAR" => Ok(FieldType::Char),
            "VARCHAR" => Ok(FieldType::Varchar),
            "STRING" | "TEXT" => Ok(FieldType::String),
            "BOOLEAN" | "BOOL" => Ok(FieldType::Boolean),
            "TINYINT" => Ok(FieldType::TinyInt),
            "SMALLINT" => Ok(FieldType::SmallInt),
            "INT" | "INTEGER" => Ok(FieldType::Int),
            "BIGINT" => Ok(FieldType::BigInt),
            "LARGEINT" => Ok(FieldType::LargeInt),
            "FLOAT" => Ok(FieldType::Float),
            "DOUBLE" => Ok(FieldType::Double),
            "DATE" | "DATEV2" => Ok(FieldType::Date),
            "DATETIME" | "DATETIMEV2" | "TIMESTAMP" => Ok(FieldType::DateTime),
            _ => Err(Error::Config(format!("unsupported field type {s:?}"))),
        }
    }
}

/// A typed value of a structured row.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    String(String),
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    LargeInt(i128),
    Float(f32),
    Double(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl FieldValue {
    /// Type carried by the value, `None` for [FieldValue::Null].
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Null => None,
            FieldValue::String(_) => Some(FieldType::String),
            FieldValue::Boolean(_) => Some(FieldType::Boolean),
            FieldValue::TinyInt(_) => Some(FieldType::TinyInt),
            FieldValue::SmallInt(_) => Some(FieldType::SmallInt),
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::BigInt(_) => Some(FieldType::BigInt),
            FieldValue::LargeInt(_) => Some(FieldType::LargeInt),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::Double(_) => Some(FieldType::Double),
            FieldValue::Date(_) => Some(FieldType::Date),
            FieldValue::DateTime(_) => Some(FieldType::DateTime),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::BigInt(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// Ordered column list of the target table as seen by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::Config("schema must have at least one field".into()));
        }
        for (idx, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(Error::Config(format!("field {idx} has an empty name")));
            }
            if fields.iter().skip(idx + 1).any(|f| f.name == field.name) {
                return Err(Error::Config(format!("duplicate field name {:?}", field.name)));
            }
        }
        Ok(Self { fields })
    }

    /// Builds a schema from parallel name and type lists, e.g. `fieldNames` and `fieldTypes`.
    pub fn from_names_and_types<N, T>(names: &[N], types: &[T]) -> Result<Self>
    where
        N: AsRef<str>,
        T: AsRef<str>,
    {
        if names.len() != types.len() {
            return Err(Error::Config(format!(
                "fieldNames has {} entries but fieldTypes has {}",
                names.len(),
                types.len()
            )));
        }
        let fields = names
            .iter()
            .zip(types)
            .map(|(name, ty)| {
                Ok(Field {
                    name: name.as_ref().to_string(),
                    field_type: ty.as_ref().parse()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}
