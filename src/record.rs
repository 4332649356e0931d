//! The decoded data model delivered to the application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::position::LogPos;
use crate::proto;

/// Kind of row-level change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A decoded scalar or binary column value. Closed set; anything the
/// dispatch table does not recognize stays raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Point { x: f64, y: f64 },
    Bytes(Vec<u8>),
}

/// One column's value within a change record.
///
/// `value` is `None` only when the decoding plugin omitted the column as
/// unchanged and no backfill has replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub column: String,
    pub type_oid: i64,
    pub unchanged: bool,
    pub value: Option<Value>,
}

/// One row-level change decoded from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub op: ChangeOperation,
    pub new_tuple: Vec<Datum>,
    pub old_tuple: Vec<Datum>,
    /// WAL position this change was decoded at.
    pub position: LogPos,
    pub transaction_id: Option<u32>,
    pub commit_time: Option<DateTime<Utc>>,
}

/// Control events published on the client's event feed.
#[derive(Debug)]
pub enum Event {
    /// One line (trailing newline stripped) from the backend's stderr.
    StderrLine(String),
    /// The stream terminated unexpectedly and a new one is about to be
    /// started from the last confirmed position.
    Reconnected,
    /// The stream terminated with a fault: a non-zero backend exit, or a
    /// framing/decode/I-O fault captured before exit.
    BackendExitFault(Error),
    /// A backfill lookup for unchanged columns failed; the affected record
    /// was still delivered with those values absent.
    BackfillFault { table: String, error: Error },
}

fn value_of(datum: proto::Datum) -> Option<Value> {
    match datum {
        proto::Datum::Int32(v) => Some(Value::Int32(v)),
        proto::Datum::Int64(v) => Some(Value::Int64(v)),
        proto::Datum::Float(v) => Some(Value::Float32(v)),
        proto::Datum::Double(v) => Some(Value::Float64(v)),
        proto::Datum::Bool(v) => Some(Value::Bool(v)),
        proto::Datum::String(v) => Some(Value::String(v)),
        proto::Datum::Bytes(v) => Some(Value::Bytes(v)),
        proto::Datum::Point(p) => Some(Value::Point { x: p.x, y: p.y }),
        proto::Datum::UnchangedNoValue(_) => None,
    }
}

impl From<proto::DatumMessage> for Datum {
    fn from(m: proto::DatumMessage) -> Self {
        let unchanged = matches!(m.datum, Some(proto::Datum::UnchangedNoValue(true)));
        Datum {
            column: m.column_name.unwrap_or_default(),
            type_oid: m.column_type.unwrap_or_default(),
            unchanged,
            value: m.datum.and_then(value_of),
        }
    }
}

impl TryFrom<proto::RowMessage> for ChangeRecord {
    type Error = Error;

    fn try_from(m: proto::RowMessage) -> Result<Self, Self::Error> {
        let raw_op = m.op.unwrap_or(proto::Op::Unknown as i32);
        let op = match proto::Op::try_from(raw_op) {
            Ok(proto::Op::Insert) => ChangeOperation::Insert,
            Ok(proto::Op::Update) => ChangeOperation::Update,
            Ok(proto::Op::Delete) => ChangeOperation::Delete,
            _ => return Err(Error::UnsupportedOp(raw_op)),
        };
        Ok(ChangeRecord {
            table: m.table.unwrap_or_default(),
            op,
            new_tuple: m.new_tuple.into_iter().map(Datum::from).collect(),
            old_tuple: m.old_tuple.into_iter().map(Datum::from).collect(),
            position: LogPos::new(m.log_position.unwrap_or(0)),
            transaction_id: m.transaction_id,
            commit_time: m
                .commit_time
                .and_then(|micros| DateTime::from_timestamp_micros(micros as i64)),
        })
    }
}
