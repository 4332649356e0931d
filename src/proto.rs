//! Wire messages emitted by the `decoderbufs` logical-decoding plugin.
//!
//! Hand-mirrored protobuf definitions; the plugin owns the schema and the
//! tag numbers must stay exact for wire compatibility. One encoded
//! [`RowMessage`] is carried per frame on the backend's stdout.

/// Row-level operation carried by a [`RowMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Op {
    Unknown = -1,
    Insert = 0,
    Update = 1,
    Delete = 2,
}

/// Geometric point datum.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Point {
    #[prost(double, tag = "1")]
    pub x: f64,
    #[prost(double, tag = "2")]
    pub y: f64,
}

/// One column's value within a decoded row.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DatumMessage {
    #[prost(string, optional, tag = "1")]
    pub column_name: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub column_type: Option<i64>,
    #[prost(oneof = "Datum", tags = "3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub datum: Option<Datum>,
}

/// The typed payload of a [`DatumMessage`].
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Datum {
    #[prost(int32, tag = "3")]
    Int32(i32),
    #[prost(int64, tag = "4")]
    Int64(i64),
    #[prost(float, tag = "5")]
    Float(f32),
    #[prost(double, tag = "6")]
    Double(f64),
    #[prost(bool, tag = "7")]
    Bool(bool),
    #[prost(string, tag = "8")]
    String(String),
    #[prost(bytes, tag = "9")]
    Bytes(Vec<u8>),
    #[prost(message, tag = "10")]
    Point(Point),
    /// The plugin determined the column did not change and omitted its
    /// value (commonly large out-of-line values).
    #[prost(bool, tag = "11")]
    UnchangedNoValue(bool),
}

/// One decoded row-level change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RowMessage {
    #[prost(uint32, optional, tag = "1")]
    pub transaction_id: Option<u32>,
    /// Commit time in microseconds since the Unix epoch.
    #[prost(uint64, optional, tag = "2")]
    pub commit_time: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub table: Option<String>,
    #[prost(enumeration = "Op", optional, tag = "4")]
    pub op: Option<i32>,
    #[prost(message, repeated, tag = "5")]
    pub new_tuple: Vec<DatumMessage>,
    #[prost(message, repeated, tag = "6")]
    pub old_tuple: Vec<DatumMessage>,
    /// WAL position the change was decoded at.
    #[prost(uint64, optional, tag = "7")]
    pub log_position: Option<u64>,
}
