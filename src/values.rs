//! Type extraction: OID dispatch, enum labels, and unchanged-column
//! backfill.

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::record::{Datum, Value};

/// OID of the `text` type, applied to backfilled values.
pub const TEXT_OID: i64 = 25;

/// The set of enum type OIDs discovered in the database at client startup.
///
/// Immutable after construction and threaded through to the extract
/// context; there is no process-global state.
#[derive(Debug, Clone, Default)]
pub struct EnumSet(HashSet<i64>);

impl EnumSet {
    pub fn contains(&self, oid: i64) -> bool {
        self.0.contains(&oid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<i64> for EnumSet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        EnumSet(iter.into_iter().collect())
    }
}

impl From<HashSet<i64>> for EnumSet {
    fn from(set: HashSet<i64>) -> Self {
        EnumSet(set)
    }
}

/// Classification of a column's type OID.
///
/// Closed set: every OID the extractor understands has a variant here, and
/// anything else is explicitly [`PgType::Enum`] (if the catalog scan saw
/// it) or [`PgType::Unknown`]. Supporting a new OID is a change to this
/// enum, not a silent fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Char,
    Varchar,
    Bpchar,
    Text,
    Json,
    Xml,
    Uuid,
    Timestamp,
    Timestamptz,
    Point,
    Bytea,
    Enum,
    Unknown,
}

impl PgType {
    /// Classifies a type OID against the well-known set and the database's
    /// enum types.
    pub fn from_oid(oid: i64, enums: &EnumSet) -> PgType {
        match oid {
            16 => PgType::Bool,
            17 => PgType::Bytea,
            18 => PgType::Char,
            20 => PgType::Int8,
            21 => PgType::Int2,
            23 => PgType::Int4,
            25 => PgType::Text,
            26 => PgType::Oid,
            114 => PgType::Json,
            142 => PgType::Xml,
            600 => PgType::Point,
            700 => PgType::Float4,
            701 => PgType::Float8,
            1042 => PgType::Bpchar,
            1043 => PgType::Varchar,
            1114 => PgType::Timestamp,
            1184 => PgType::Timestamptz,
            1700 => PgType::Numeric,
            2950 => PgType::Uuid,
            _ if enums.contains(oid) => PgType::Enum,
            _ => PgType::Unknown,
        }
    }
}

/// Fault returned when a datum's type OID is neither well known nor an
/// enum type. Carries the raw bytes so the caller can still use them.
#[derive(Debug, Clone, Error)]
#[error("unknown type OID {oid} for column {column:?}")]
pub struct UnknownOid {
    pub oid: i64,
    pub column: String,
    /// The datum's raw bytes, when the plugin sent any.
    pub raw: Option<Vec<u8>>,
}

/// Extraction context handed to converters alongside each change record.
#[derive(Debug, Clone, Default)]
pub struct ExtractContext {
    enums: EnumSet,
}

impl ExtractContext {
    pub fn new(enums: EnumSet) -> Self {
        Self { enums }
    }

    pub fn enums(&self) -> &EnumSet {
        &self.enums
    }

    /// Produces a datum's decoded value according to its type OID.
    ///
    /// Known OIDs yield the corresponding typed value (`Ok(None)` when the
    /// plugin sent no value of that shape, e.g. an unchanged column). Enum
    /// OIDs decode the raw bytes as a UTF-8 label string. Anything else is
    /// an [`UnknownOid`] fault carrying the raw bytes.
    pub fn extract(&self, datum: &Datum) -> std::result::Result<Option<Value>, UnknownOid> {
        let value = match PgType::from_oid(datum.type_oid, &self.enums) {
            PgType::Bool => typed(datum, |v| matches!(v, Value::Bool(_))),
            PgType::Int2 | PgType::Int4 => typed(datum, |v| matches!(v, Value::Int32(_))),
            PgType::Int8 | PgType::Oid => typed(datum, |v| matches!(v, Value::Int64(_))),
            PgType::Float4 => typed(datum, |v| matches!(v, Value::Float32(_))),
            PgType::Float8 | PgType::Numeric => typed(datum, |v| matches!(v, Value::Float64(_))),
            PgType::Char
            | PgType::Varchar
            | PgType::Bpchar
            | PgType::Text
            | PgType::Json
            | PgType::Xml
            | PgType::Uuid
            | PgType::Timestamp
            | PgType::Timestamptz => typed(datum, |v| matches!(v, Value::String(_))),
            PgType::Point => typed(datum, |v| matches!(v, Value::Point { .. })),
            PgType::Bytea => typed(datum, |v| matches!(v, Value::Bytes(_))),
            PgType::Enum => match &datum.value {
                Some(Value::Bytes(raw)) => {
                    Some(Value::String(String::from_utf8_lossy(raw).into_owned()))
                }
                other => other.clone(),
            },
            PgType::Unknown => {
                return Err(UnknownOid {
                    oid: datum.type_oid,
                    column: datum.column.clone(),
                    raw: match &datum.value {
                        Some(Value::Bytes(raw)) => Some(raw.clone()),
                        _ => None,
                    },
                });
            }
        };
        Ok(value)
    }
}

fn typed(datum: &Datum, matches: impl Fn(&Value) -> bool) -> Option<Value> {
    datum.value.as_ref().filter(|v| matches(v)).cloned()
}

/// Backfills values the decoding plugin omitted as unchanged.
///
/// When the tuple carries a numeric value in `key_column` and at least one
/// unchanged datum, issues one point lookup selecting exactly the
/// unchanged columns and overwrites each affected datum with the fetched
/// value, re-typed as text. A missing row is tolerated: the datum stays
/// absent. Any other lookup fault propagates to the caller, which scopes
/// it to the one record.
pub async fn backfill_unchanged(
    catalog: &dyn Catalog,
    key_column: &str,
    table: &str,
    tuple: &mut [Datum],
) -> Result<()> {
    let mut key: i64 = 0;
    let mut unchanged: Vec<usize> = Vec::new();
    for (i, datum) in tuple.iter().enumerate() {
        if datum.column == key_column {
            key = match datum.value {
                Some(Value::Int32(v)) => i64::from(v),
                Some(Value::Int64(v)) => v,
                _ => 0,
            };
        }
        if datum.unchanged {
            unchanged.push(i);
        }
    }
    if unchanged.is_empty() || key == 0 {
        return Ok(());
    }

    let columns: Vec<String> = unchanged.iter().map(|&i| tuple[i].column.clone()).collect();
    match catalog.select_row_text(table, key_column, key, &columns).await? {
        Some(values) => {
            for (&i, text) in unchanged.iter().zip(values) {
                if let Some(text) = text {
                    tuple[i].type_oid = TEXT_OID;
                    tuple[i].value = Some(Value::String(text));
                }
            }
        }
        None => {
            debug!(table, key, "backfill row not found");
        }
    }
    Ok(())
}
