//! Error types and result handling for pg-logstream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Most runtime faults never surface through function return values: the
//! stream captures them internally and reports them once through its
//! finished signal (and, at the client level, as events). Only setup-time
//! faults (spawning the backend, attaching pipes, the catalog scan) are
//! returned synchronously.

use thiserror::Error;

use crate::values::UnknownOid;

/// The main error type for pg-logstream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `start` was called on a stream that is already active.
    #[error("replication stream is already running")]
    AlreadyRunning,

    /// I/O error, typically from spawning the backend or reading its pipes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend's stdout ended in the middle of a frame.
    ///
    /// This is a framing fault, distinct from an ordinary I/O error: the
    /// pipe was healthy but delivered fewer bytes than the length prefix
    /// promised.
    #[error("unable to read whole frame of {wanted} bytes")]
    ShortFrame {
        /// Number of bytes the frame header announced.
        wanted: usize,
    },

    /// The frame length prefix announced more bytes than any plausible
    /// message, meaning the stream is corrupt or misaligned.
    #[error("implausible frame length {len}")]
    OversizedFrame {
        /// Length the prefix announced.
        len: u64,
    },

    /// A frame payload could not be deserialized into a row message.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A decoded row message carried an operation this client does not
    /// deliver (anything other than insert/update/delete).
    #[error("unsupported change operation {0}")]
    UnsupportedOp(i32),

    /// PostgreSQL error from the catalog scan or a backfill lookup.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The backend process exited with a non-zero status.
    #[error("backend exited with {status}")]
    BackendExit {
        /// Exit status reported by the operating system.
        status: std::process::ExitStatus,
    },

    /// A column's type OID is outside the closed dispatch set and was not
    /// found in the known-enum set. Non-fatal; converters decide whether
    /// to tolerate it.
    #[error(transparent)]
    UnknownOid(#[from] UnknownOid),
}

/// A convenient Result type alias for pg-logstream operations.
pub type Result<T> = std::result::Result<T, Error>;
