//! Positions in the logical change stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A position in the PostgreSQL write-ahead log.
///
/// Opaque 64-bit marker, monotonically non-decreasing within a stream. The
/// textual form splits it into two 32-bit halves rendered in hexadecimal
/// joined by `/` (e.g. `17/A4C41EC0`), the same notation the server uses
/// for LSNs, and round-trips losslessly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct LogPos(u64);

impl LogPos {
    /// The zero position: "start from the slot's confirmed position".
    pub const ZERO: LogPos = LogPos(0);

    pub const fn new(raw: u64) -> Self {
        LogPos(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Error parsing the textual `HIGH/LOW` form of a [`LogPos`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid log position: {0:?}")]
pub struct ParseLogPosError(String);

impl FromStr for LogPos {
    type Err = ParseLogPosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| ParseLogPosError(s.to_string()))?;
        let high = u32::from_str_radix(high, 16).map_err(|_| ParseLogPosError(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| ParseLogPosError(s.to_string()))?;
        Ok(LogPos((u64::from(high) << 32) | u64::from(low)))
    }
}

impl From<u64> for LogPos {
    fn from(raw: u64) -> Self {
        LogPos(raw)
    }
}

impl From<LogPos> for u64 {
    fn from(pos: LogPos) -> Self {
        pos.0
    }
}

impl From<LogPos> for String {
    fn from(pos: LogPos) -> Self {
        pos.to_string()
    }
}

impl TryFrom<String> for LogPos {
    type Error = ParseLogPosError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
