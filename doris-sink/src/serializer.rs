//! Renders [Record]s into the wire representation expected by stream load.
//!
//! Structured rows are checked against the [Schema] (arity and type) and written either as one
//! JSON object per row or as one delimited line. Every [SerializedRow] carries its trailing record
//! delimiter, so a batch payload is the plain concatenation of its rows.

use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::{CsvFormat, WireFormat};
use crate::error::{Error, Result};
use crate::record::{Field, FieldValue, Record, Row, RowValues, Schema};

/// Hidden column carrying the delete flag of a row.
pub(crate) const DELETE_SIGN_COLUMN: &str = "__DORIS_DELETE_SIGN__";
/// CSV null sentinel.
const CSV_NULL: &str = "\\N";
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Wire-ready bytes of one record, including the record delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedRow(Bytes);

impl SerializedRow {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<String> for SerializedRow {
    fn from(value: String) -> Self {
        SerializedRow(Bytes::from(value))
    }
}

impl From<Vec<u8>> for SerializedRow {
    fn from(value: Vec<u8>) -> Self {
        SerializedRow(Bytes::from(value))
    }
}

/// Turns records into [SerializedRow]s for one wire format and (optional) schema.
#[derive(Debug, Clone)]
pub struct RowSerializer {
    format: WireFormat,
    schema: Option<Schema>,
    enable_delete: bool,
}

impl RowSerializer {
    pub fn new(format: WireFormat, schema: Option<Schema>, enable_delete: bool) -> Self {
        Self {
            format,
            schema,
            enable_delete,
        }
    }

    /// Value of the `columns` load header, set only for structured mode.
    pub fn columns(&self) -> Option<String> {
        let schema = self.schema.as_ref()?;
        let mut columns = schema.names().collect::<Vec<_>>().join(",");
        if self.enable_delete {
            columns.push(',');
            columns.push_str(DELETE_SIGN_COLUMN);
        }
        Some(columns)
    }

    pub fn serialize(&self, record: &Record) -> Result<SerializedRow> {
        match record {
            Record::Text(text) => {
                let mut line = String::with_capacity(text.len() + 2);
                line.push_str(text);
                line.push_str(self.format.record_delimiter());
                Ok(line.into())
            }
            Record::Structured(row) => self.serialize_row(row),
        }
    }

    fn serialize_row(&self, row: &Row) -> Result<SerializedRow> {
        let schema = self.schema.as_ref().ok_or_else(|| {
            Error::Serialization(
                "structured record received but no fieldNames/fieldTypes are configured"
                    .to_string(),
            )
        })?;
        let values = ordered_values(schema, row)?;
        for (field, value) in schema.fields().iter().zip(&values) {
            check_value(field, value)?;
        }
        let delete_sign = self
            .enable_delete
            .then(|| u8::from(row.kind().is_retraction()));

        match &self.format {
            WireFormat::Csv(csv) => {
                let mut line = String::new();
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        line.push_str(&csv.column_separator);
                    }
                    write_csv_value(csv, value, &mut line)?;
                }
                if let Some(sign) = delete_sign {
                    line.push_str(&csv.column_separator);
                    line.push_str(&sign.to_string());
                }
                line.push_str(&csv.line_delimiter);
                Ok(line.into())
            }
            WireFormat::Json { .. } => {
                let mut json = serde_json::to_vec(&JsonRow {
                    fields: schema.fields(),
                    values: &values,
                    delete_sign,
                })
                .map_err(|e| Error::Serialization(e.to_string()))?;
                json.extend_from_slice(self.format.record_delimiter().as_bytes());
                Ok(json.into())
            }
        }
    }
}

/// Lines the row values up with the schema, by position or by name.
fn ordered_values<'a>(schema: &Schema, row: &'a Row) -> Result<Vec<&'a FieldValue>> {
    if row.len() != schema.len() {
        return Err(Error::Serialization(format!(
            "record has {} fields but the schema declares {}",
            row.len(),
            schema.len()
        )));
    }
    match &row.values {
        RowValues::Positional(values) => Ok(values.iter().collect()),
        RowValues::Named(pairs) => schema
            .names()
            .map(|name| {
                pairs
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value)
                    .ok_or_else(|| {
                        Error::Serialization(format!("record has no value for field {name:?}"))
                    })
            })
            .collect(),
    }
}

fn check_value(field: &Field, value: &FieldValue) -> Result<()> {
    if !field.field_type.accepts(value) {
        let actual = value
            .field_type()
            .map_or_else(|| "NULL".to_string(), |t| t.to_string());
        return Err(Error::Serialization(format!(
            "field {:?} is declared {} but got a {actual} value",
            field.name, field.field_type
        )));
    }
    let finite = match value {
        FieldValue::Float(v) => v.is_finite(),
        FieldValue::Double(v) => v.is_finite(),
        _ => true,
    };
    if !finite {
        return Err(Error::Serialization(format!(
            "field {:?} holds a non-finite number",
            field.name
        )));
    }
    Ok(())
}

fn write_csv_value(csv: &CsvFormat, value: &FieldValue, out: &mut String) -> Result<()> {
    let text = match value {
        FieldValue::Null => {
            out.push_str(CSV_NULL);
            return Ok(());
        }
        FieldValue::String(s) => return write_csv_text(csv, s, out),
        FieldValue::Boolean(b) => u8::from(*b).to_string(),
        FieldValue::TinyInt(v) => v.to_string(),
        FieldValue::SmallInt(v) => v.to_string(),
        FieldValue::Int(v) => v.to_string(),
        FieldValue::BigInt(v) => v.to_string(),
        FieldValue::LargeInt(v) => v.to_string(),
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Double(v) => v.to_string(),
        FieldValue::Date(d) => d.format(DATE_FORMAT).to_string(),
        FieldValue::DateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
    };
    write_csv_text(csv, &text, out)
}

/// Writes a text value, enclosing it when it collides with the delimiters.
fn write_csv_text(csv: &CsvFormat, text: &str, out: &mut String) -> Result<()> {
    let collides = text.contains(csv.column_separator.as_str())
        || text.contains(csv.line_delimiter.as_str());
    match csv.enclose {
        Some(quote) if collides || text.contains(quote) => {
            out.push(quote);
            for c in text.chars() {
                if c == quote || c == csv.escape {
                    out.push(csv.escape);
                }
                out.push(c);
            }
            out.push(quote);
        }
        None if collides => {
            return Err(Error::Serialization(format!(
                "value {text:?} contains the column separator or line delimiter, set the enclose property"
            )));
        }
        _ => out.push_str(text),
    }
    Ok(())
}

struct JsonRow<'a> {
    fields: &'a [Field],
    values: &'a [&'a FieldValue],
    delete_sign: Option<u8>,
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.fields.len() + usize::from(self.delete_sign.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        for (field, value) in self.fields.iter().zip(self.values) {
            map.serialize_entry(&field.name, &JsonValue(value))?;
        }
        if let Some(sign) = self.delete_sign {
            map.serialize_entry(DELETE_SIGN_COLUMN, &sign)?;
        }
        map.end()
    }
}

struct JsonValue<'a>(&'a FieldValue);

impl Serialize for JsonValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Boolean(b) => serializer.serialize_bool(*b),
            FieldValue::TinyInt(v) => serializer.serialize_i8(*v),
            FieldValue::SmallInt(v) => serializer.serialize_i16(*v),
            FieldValue::Int(v) => serializer.serialize_i32(*v),
            FieldValue::BigInt(v) => serializer.serialize_i64(*v),
            FieldValue::LargeInt(v) => serializer.serialize_i128(*v),
            FieldValue::Float(v) => serializer.serialize_f32(*v),
            FieldValue::Double(v) => serializer.serialize_f64(*v),
            FieldValue::Date(d) => serializer.collect_str(&d.format(DATE_FORMAT)),
            FieldValue::DateTime(dt) => serializer.collect_str(&dt.format(DATETIME_FORMAT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::Value;

    use super::*;
    use crate::record::RowKind;

    fn grid_schema() -> Schema {
        Schema::from_names_and_types(
            &["grid_no", "longitude", "latitude"],
            &["string", "double", "double"],
        )
        .unwrap()
    }

    fn grid_row() -> Row {
        Row::new(vec!["北京".into(), 116.405419.into(), 39.916927.into()])
    }

    fn json() -> WireFormat {
        WireFormat::Json {
            strip_outer_array: false,
        }
    }

    fn csv() -> WireFormat {
        WireFormat::Csv(CsvFormat::default())
    }

    fn as_str(row: &SerializedRow) -> &str {
        std::str::from_utf8(row.as_bytes()).unwrap()
    }

    #[test]
    fn json_round_trip() {
        let serializer = RowSerializer::new(json(), Some(grid_schema()), false);
        let row = serializer.serialize(&grid_row().into()).unwrap();
        assert!(as_str(&row).ends_with('\n'));

        let decoded: Value = serde_json::from_slice(row.as_bytes()).unwrap();
        assert_eq!(decoded["grid_no"], "北京");
        assert_eq!(decoded["longitude"].as_f64(), Some(116.405419));
        assert_eq!(decoded["latitude"].as_f64(), Some(39.916927));
    }

    #[test]
    fn csv_round_trip() {
        let serializer = RowSerializer::new(csv(), Some(grid_schema()), false);
        let row = serializer.serialize(&grid_row().into()).unwrap();
        assert_eq!(as_str(&row), "北京\t116.405419\t39.916927\n");

        let fields: Vec<&str> = as_str(&row).trim_end().split('\t').collect();
        assert_eq!(fields[0], "北京");
        assert_eq!(fields[1].parse::<f64>().unwrap(), 116.405419);
        assert_eq!(fields[2].parse::<f64>().unwrap(), 39.916927);
    }

    #[test]
    fn named_rows_follow_schema_order() {
        let serializer = RowSerializer::new(csv(), Some(grid_schema()), false);
        let row = Row::named([
            ("latitude", FieldValue::from(2.5)),
            ("grid_no", FieldValue::from("a")),
            ("longitude", FieldValue::from(1.5)),
        ]);
        let row = serializer.serialize(&row.into()).unwrap();
        assert_eq!(as_str(&row), "a\t1.5\t2.5\n");

        let missing = Row::named([
            ("latitude", FieldValue::from(2.5)),
            ("grid", FieldValue::from("a")),
            ("longitude", FieldValue::from(1.5)),
        ]);
        assert!(matches!(
            serializer.serialize(&missing.into()),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn rejects_mismatched_rows() {
        let serializer = RowSerializer::new(json(), Some(grid_schema()), false);

        let short = Row::new(vec!["a".into(), 1.0.into()]);
        assert!(matches!(
            serializer.serialize(&short.into()),
            Err(Error::Serialization(_))
        ));

        let wrong_type = Row::new(vec![1.into(), 1.0.into(), 1.0.into()]);
        assert!(matches!(
            serializer.serialize(&wrong_type.into()),
            Err(Error::Serialization(_))
        ));

        let not_finite = Row::new(vec!["a".into(), f64::NAN.into(), 1.0.into()]);
        assert!(matches!(
            serializer.serialize(&not_finite.into()),
            Err(Error::Serialization(_))
        ));

        let schemaless = RowSerializer::new(json(), None, false);
        assert!(schemaless.serialize(&grid_row().into()).is_err());
    }

    #[test]
    fn nulls_and_typed_values() {
        let schema = Schema::from_names_and_types(
            &["flag", "day", "at", "big", "note"],
            &["boolean", "date", "datetime", "largeint", "varchar(8)"],
        )
        .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let at = day.and_hms_milli_opt(13, 5, 9, 250).unwrap();
        let row = Row::new(vec![
            true.into(),
            FieldValue::Date(day),
            FieldValue::DateTime(at),
            FieldValue::LargeInt(170_141_183_460_469_231_731_687_303_715_884_105_727),
            FieldValue::Null,
        ]);

        let csv_row = RowSerializer::new(csv(), Some(schema.clone()), false)
            .serialize(&row.clone().into())
            .unwrap();
        assert_eq!(
            as_str(&csv_row),
            "1\t2024-02-29\t2024-02-29 13:05:09.250\t170141183460469231731687303715884105727\t\\N\n"
        );

        let json_row = RowSerializer::new(json(), Some(schema), false)
            .serialize(&row.into())
            .unwrap();
        let text = as_str(&json_row);
        assert!(text.contains("\"flag\":true"));
        assert!(text.contains("\"note\":null"));
        assert!(text.contains("\"big\":170141183460469231731687303715884105727"));
    }

    #[test]
    fn csv_separator_collisions() {
        let schema = Schema::from_names_and_types(&["a", "b"], &["string", "int"]).unwrap();
        let row = Row::new(vec!["x\ty\"z".into(), 1.into()]);

        let plain = RowSerializer::new(csv(), Some(schema.clone()), false);
        assert!(matches!(
            plain.serialize(&row.clone().into()),
            Err(Error::Serialization(_))
        ));

        let enclosed = RowSerializer::new(
            WireFormat::Csv(CsvFormat {
                enclose: Some('"'),
                ..CsvFormat::default()
            }),
            Some(schema),
            false,
        );
        let line = enclosed.serialize(&row.into()).unwrap();
        assert_eq!(as_str(&line), "\"x\ty\\\"z\"\t1\n");
    }

    #[test]
    fn text_records_get_the_delimiter() {
        let csv_crlf = WireFormat::Csv(CsvFormat {
            column_separator: ",".to_string(),
            line_delimiter: "\r\n".to_string(),
            ..CsvFormat::default()
        });
        let row = RowSerializer::new(csv_crlf, None, false)
            .serialize(&"1,a".into())
            .unwrap();
        assert_eq!(as_str(&row), "1,a\r\n");

        let row = RowSerializer::new(json(), None, false)
            .serialize(&r#"{"id":1}"#.into())
            .unwrap();
        assert_eq!(as_str(&row), "{\"id\":1}\n");
    }

    #[test]
    fn delete_sign() {
        let schema = Schema::from_names_and_types(&["id"], &["int"]).unwrap();
        let serializer = RowSerializer::new(csv(), Some(schema.clone()), true);
        assert_eq!(
            serializer.columns().as_deref(),
            Some("id,__DORIS_DELETE_SIGN__")
        );

        let insert = serializer.serialize(&Row::new(vec![1.into()]).into()).unwrap();
        assert_eq!(as_str(&insert), "1\t0\n");
        let delete = serializer
            .serialize(&Row::new(vec![1.into()]).with_kind(RowKind::Delete).into())
            .unwrap();
        assert_eq!(as_str(&delete), "1\t1\n");

        let json_delete = RowSerializer::new(json(), Some(schema), true)
            .serialize(
                &Row::new(vec![1.into()])
                    .with_kind(RowKind::UpdateBefore)
                    .into(),
            )
            .unwrap();
        assert_eq!(as_str(&json_delete), "{\"id\":1,\"__DORIS_DELETE_SIGN__\":1}\n");

        assert_eq!(RowSerializer::new(csv(), None, false).columns(), None);
    }
}
