//! Column definitions and row-cell decoding
//!
//! The binlog does not carry column names or declared types with row
//! events, only wire values. Every decoded row therefore consults the
//! tracked [`ColumnDef`] at the same ordinal, which knows how to turn a
//! wire cell into the canonical JSON value and when to refuse with a
//! [`ColumnCastError`].

use crate::error::ColumnCastError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw cell as delivered by the binlog client, before it has been
/// checked against the tracked column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    /// Signed integer family (TINYINT..BIGINT)
    Int(i64),
    /// Unsigned integer family, also ENUM ordinals and SET bitmasks
    UInt(u64),
    Float(f64),
    /// Text already decoded by the wire client (temporal/decimal render
    /// here too)
    Text(String),
    /// Undecoded bytes: string columns pre-charset, blobs, geometry
    Bytes(Vec<u8>),
}

impl CellValue {
    /// Short description used in cast-error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Int(_) => "signed integer",
            CellValue::UInt(_) => "unsigned integer",
            CellValue::Float(_) => "float",
            CellValue::Text(_) => "string",
            CellValue::Bytes(_) => "bytes",
        }
    }
}

/// Width/signedness and per-type metadata for a tracked column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    /// TINYINT/SMALLINT/MEDIUMINT/INT by byte width
    Int { bytes: u8, signed: bool },
    BigInt { signed: bool },
    Decimal { precision: u8, scale: u8 },
    Float,
    Double,
    Bit { bits: u16 },
    /// CHAR/VARCHAR/*TEXT with the column charset
    String { length: u32, charset: String },
    /// BINARY/VARBINARY/*BLOB
    Binary { length: u32 },
    Enum { values: Vec<String> },
    Set { values: Vec<String> },
    Date,
    Time { fsp: u8 },
    DateTime { fsp: u8 },
    Timestamp { fsp: u8 },
    Year,
    Json,
    Geometry,
}

impl ColumnType {
    /// Human-readable type name, used in diffs and cast errors.
    pub fn describe(&self) -> String {
        match self {
            ColumnType::Int { bytes, signed } => {
                let base = match bytes {
                    1 => "tinyint",
                    2 => "smallint",
                    3 => "mediumint",
                    _ => "int",
                };
                if *signed {
                    base.to_string()
                } else {
                    format!("{base} unsigned")
                }
            }
            ColumnType::BigInt { signed: true } => "bigint".to_string(),
            ColumnType::BigInt { signed: false } => "bigint unsigned".to_string(),
            ColumnType::Decimal { precision, scale } => format!("decimal({precision},{scale})"),
            ColumnType::Float => "float".to_string(),
            ColumnType::Double => "double".to_string(),
            ColumnType::Bit { bits } => format!("bit({bits})"),
            ColumnType::String { length, charset } => {
                format!("varchar({length}) charset {charset}")
            }
            ColumnType::Binary { length } => format!("varbinary({length})"),
            ColumnType::Enum { values } => format!("enum({} values)", values.len()),
            ColumnType::Set { values } => format!("set({} values)", values.len()),
            ColumnType::Date => "date".to_string(),
            ColumnType::Time { fsp } => format!("time({fsp})"),
            ColumnType::DateTime { fsp } => format!("datetime({fsp})"),
            ColumnType::Timestamp { fsp } => format!("timestamp({fsp})"),
            ColumnType::Year => "year".to_string(),
            ColumnType::Json => "json".to_string(),
            ColumnType::Geometry => "geometry".to_string(),
        }
    }
}

/// A tracked column: name plus declared type. Ordinal position is the
/// column's index within its table, which is the identity used to zip
/// row images to names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Convenience constructor for a signed 4-byte INT.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(
            name,
            ColumnType::Int {
                bytes: 4,
                signed: true,
            },
        )
    }

    /// Convenience constructor for a utf8 VARCHAR.
    pub fn varchar(name: impl Into<String>, length: u32) -> Self {
        Self::new(
            name,
            ColumnType::String {
                length,
                charset: "utf8mb4".to_string(),
            },
        )
    }

    /// Decode a wire cell into the canonical JSON value.
    ///
    /// `database`/`table` only provide context for the error; decoding
    /// itself depends on nothing but the cell and the declared type.
    pub fn decode(
        &self,
        database: &str,
        table: &str,
        cell: &CellValue,
    ) -> Result<Value, ColumnCastError> {
        if matches!(cell, CellValue::Null) {
            return Ok(Value::Null);
        }
        let cast_error = || ColumnCastError {
            database: database.to_string(),
            table: table.to_string(),
            column: self.name.clone(),
            expected: self.kind.describe(),
            found: cell.describe().to_string(),
        };

        match &self.kind {
            ColumnType::Int { bytes, signed } => {
                let v = match cell {
                    CellValue::Int(v) => *v,
                    CellValue::UInt(v) => i64::try_from(*v).map_err(|_| cast_error())?,
                    _ => return Err(cast_error()),
                };
                let width = u32::from(*bytes) * 8;
                let (lo, hi) = if *signed {
                    (-(1i64 << (width - 1)), (1i64 << (width - 1)) - 1)
                } else {
                    (0, (1i64 << width) - 1)
                };
                if v < lo || v > hi {
                    return Err(cast_error());
                }
                Ok(Value::from(v))
            }
            ColumnType::BigInt { signed } => match cell {
                CellValue::Int(v) if *signed => Ok(Value::from(*v)),
                CellValue::Int(v) if *v >= 0 => Ok(Value::from(*v)),
                CellValue::UInt(v) if !*signed => Ok(Value::from(*v)),
                CellValue::UInt(v) => {
                    let v = i64::try_from(*v).map_err(|_| cast_error())?;
                    Ok(Value::from(v))
                }
                _ => Err(cast_error()),
            },
            ColumnType::Decimal { .. } => {
                let text = match cell {
                    CellValue::Text(s) => s.clone(),
                    CellValue::Bytes(b) => {
                        String::from_utf8(b.clone()).map_err(|_| cast_error())?
                    }
                    CellValue::Int(v) => v.to_string(),
                    CellValue::UInt(v) => v.to_string(),
                    _ => return Err(cast_error()),
                };
                let parsed: f64 = text.trim().parse().map_err(|_| cast_error())?;
                Ok(serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            ColumnType::Float | ColumnType::Double => {
                let v = match cell {
                    CellValue::Float(v) => *v,
                    CellValue::Int(v) => *v as f64,
                    CellValue::UInt(v) => *v as f64,
                    _ => return Err(cast_error()),
                };
                Ok(serde_json::Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            ColumnType::Bit { .. } => match cell {
                CellValue::UInt(v) => Ok(Value::from(*v)),
                CellValue::Int(v) if *v >= 0 => Ok(Value::from(*v)),
                _ => Err(cast_error()),
            },
            ColumnType::String { charset, .. } => {
                let s = match cell {
                    CellValue::Text(s) => s.clone(),
                    CellValue::Bytes(b) => decode_charset(b, charset).ok_or_else(cast_error)?,
                    _ => return Err(cast_error()),
                };
                Ok(Value::String(s))
            }
            ColumnType::Binary { .. } | ColumnType::Geometry => match cell {
                CellValue::Bytes(b) => Ok(Value::String(BASE64.encode(b))),
                CellValue::Text(s) => Ok(Value::String(BASE64.encode(s.as_bytes()))),
                _ => Err(cast_error()),
            },
            ColumnType::Enum { values } => match cell {
                // MySQL enum ordinals are 1-based; 0 is the empty value.
                CellValue::UInt(0) | CellValue::Int(0) => Ok(Value::String(String::new())),
                CellValue::UInt(v) => values
                    .get(*v as usize - 1)
                    .map(|s| Value::String(s.clone()))
                    .ok_or_else(cast_error),
                CellValue::Int(v) if *v > 0 => values
                    .get(*v as usize - 1)
                    .map(|s| Value::String(s.clone()))
                    .ok_or_else(cast_error),
                CellValue::Text(s) if values.contains(s) => Ok(Value::String(s.clone())),
                _ => Err(cast_error()),
            },
            ColumnType::Set { values } => {
                let mask = match cell {
                    CellValue::UInt(v) => *v,
                    CellValue::Int(v) if *v >= 0 => *v as u64,
                    _ => return Err(cast_error()),
                };
                if values.len() < 64 && mask >= 1u64 << values.len() {
                    return Err(cast_error());
                }
                let members: Vec<Value> = values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, v)| Value::String(v.clone()))
                    .collect();
                Ok(Value::Array(members))
            }
            ColumnType::Date
            | ColumnType::Time { .. }
            | ColumnType::DateTime { .. }
            | ColumnType::Timestamp { .. } => {
                let s = match cell {
                    CellValue::Text(s) => s.clone(),
                    CellValue::Bytes(b) => {
                        String::from_utf8(b.clone()).map_err(|_| cast_error())?
                    }
                    _ => return Err(cast_error()),
                };
                Ok(Value::String(s))
            }
            ColumnType::Year => match cell {
                CellValue::Int(v) => Ok(Value::from(*v)),
                CellValue::UInt(v) => Ok(Value::from(*v)),
                _ => Err(cast_error()),
            },
            ColumnType::Json => {
                let raw = match cell {
                    CellValue::Text(s) => s.clone(),
                    CellValue::Bytes(b) => {
                        String::from_utf8(b.clone()).map_err(|_| cast_error())?
                    }
                    _ => return Err(cast_error()),
                };
                serde_json::from_str(&raw).map_err(|_| cast_error())
            }
        }
    }

    /// Report every divergence from `other` as a human-readable line.
    /// Used for logging when the mirror is suspected of drift, never for
    /// driving behavior.
    pub fn diff(&self, out: &mut Vec<String>, other: &ColumnDef, context: &str) {
        if self.name != other.name {
            out.push(format!(
                "{context}: column name `{}` vs `{}`",
                self.name, other.name
            ));
        }
        if self.kind != other.kind {
            out.push(format!(
                "{context}: column `{}` type {} vs {}",
                self.name,
                self.kind.describe(),
                other.kind.describe()
            ));
        }
    }
}

/// Decode raw string-column bytes under the column charset. Only the
/// charsets the upstream actually emits in row images need handling;
/// anything else falls back to lossy utf8.
fn decode_charset(bytes: &[u8], charset: &str) -> Option<String> {
    match charset {
        "utf8" | "utf8mb3" | "utf8mb4" | "ascii" => String::from_utf8(bytes.to_vec()).ok(),
        "latin1" => Some(bytes.iter().map(|&b| b as char).collect()),
        "binary" => Some(BASE64.encode(bytes)),
        _ => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(def: &ColumnDef, cell: CellValue) -> Result<Value, ColumnCastError> {
        def.decode("d", "t", &cell)
    }

    #[test]
    fn int_decode_and_range() {
        let col = ColumnDef::new(
            "n",
            ColumnType::Int {
                bytes: 1,
                signed: true,
            },
        );
        assert_eq!(decode(&col, CellValue::Int(-128)).unwrap(), json!(-128));
        assert_eq!(decode(&col, CellValue::Int(127)).unwrap(), json!(127));
        assert!(decode(&col, CellValue::Int(128)).is_err());

        let unsigned = ColumnDef::new(
            "n",
            ColumnType::Int {
                bytes: 1,
                signed: false,
            },
        );
        assert_eq!(decode(&unsigned, CellValue::UInt(255)).unwrap(), json!(255));
        assert!(decode(&unsigned, CellValue::Int(-1)).is_err());
    }

    #[test]
    fn string_rejects_integer() {
        let col = ColumnDef::varchar("name", 32);
        let err = decode(&col, CellValue::Int(42)).unwrap_err();
        assert_eq!(err.column, "name");
        assert_eq!(err.found, "signed integer");
    }

    #[test]
    fn int_rejects_string() {
        let col = ColumnDef::int("id");
        let err = decode(&col, CellValue::Text("x".into())).unwrap_err();
        assert_eq!(err.database, "d");
        assert_eq!(err.table, "t");
        assert!(err.expected.contains("int"));
    }

    #[test]
    fn null_decodes_for_any_type() {
        assert_eq!(
            decode(&ColumnDef::int("id"), CellValue::Null).unwrap(),
            Value::Null
        );
        assert_eq!(
            decode(&ColumnDef::varchar("s", 8), CellValue::Null).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn string_charset_decoding() {
        let col = ColumnDef::new(
            "s",
            ColumnType::String {
                length: 16,
                charset: "latin1".into(),
            },
        );
        assert_eq!(
            decode(&col, CellValue::Bytes(vec![0x63, 0x61, 0x66, 0xE9])).unwrap(),
            json!("café")
        );

        let utf8 = ColumnDef::varchar("s", 16);
        assert!(decode(&utf8, CellValue::Bytes(vec![0xFF, 0xFE])).is_err());
    }

    #[test]
    fn enum_ordinal_decoding() {
        let col = ColumnDef::new(
            "color",
            ColumnType::Enum {
                values: vec!["red".into(), "green".into(), "blue".into()],
            },
        );
        assert_eq!(decode(&col, CellValue::UInt(2)).unwrap(), json!("green"));
        assert_eq!(decode(&col, CellValue::UInt(0)).unwrap(), json!(""));
        assert!(decode(&col, CellValue::UInt(4)).is_err());
    }

    #[test]
    fn set_bitmask_decoding() {
        let col = ColumnDef::new(
            "flags",
            ColumnType::Set {
                values: vec!["a".into(), "b".into(), "c".into()],
            },
        );
        assert_eq!(decode(&col, CellValue::UInt(0b101)).unwrap(), json!(["a", "c"]));
        assert_eq!(decode(&col, CellValue::UInt(0)).unwrap(), json!([]));
        assert!(decode(&col, CellValue::UInt(0b1000)).is_err());
    }

    #[test]
    fn json_column_parses_payload() {
        let col = ColumnDef::new("doc", ColumnType::Json);
        assert_eq!(
            decode(&col, CellValue::Text(r#"{"a":1}"#.into())).unwrap(),
            json!({"a": 1})
        );
        assert!(decode(&col, CellValue::Text("not json".into())).is_err());
    }

    #[test]
    fn binary_encodes_base64() {
        let col = ColumnDef::new("payload", ColumnType::Binary { length: 16 });
        assert_eq!(
            decode(&col, CellValue::Bytes(vec![1, 2, 3])).unwrap(),
            json!("AQID")
        );
    }

    #[test]
    fn temporal_passthrough() {
        let col = ColumnDef::new("created_at", ColumnType::DateTime { fsp: 0 });
        assert_eq!(
            decode(&col, CellValue::Text("2024-05-01 12:00:00".into())).unwrap(),
            json!("2024-05-01 12:00:00")
        );
        assert!(decode(&col, CellValue::Float(1.5)).is_err());
    }

    #[test]
    fn diff_reports_type_change() {
        let a = ColumnDef::int("id");
        let b = ColumnDef::varchar("id", 10);
        let mut out = Vec::new();
        a.diff(&mut out, &b, "d.t");
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("type int"));
        assert!(out[0].contains("varchar(10)"));
    }

    #[test]
    fn column_def_roundtrips_json() {
        let col = ColumnDef::new(
            "color",
            ColumnType::Enum {
                values: vec!["red".into(), "blue".into()],
            },
        );
        let json = serde_json::to_string(&col).unwrap();
        let back: ColumnDef = serde_json::from_str(&json).unwrap();
        assert_eq!(col, back);
    }
}
