//! Stream positions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in the replicated log stream.
///
/// VLSNs increase monotonically along the log. Zero is reserved as the
/// null position, so comparisons with `max` treat an uninitialized
/// position as older than any real one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Vlsn(u64);

impl Vlsn {
    /// The null (uninitialized) position.
    pub const NULL: Vlsn = Vlsn(0);

    /// The first position of any log.
    pub const FIRST: Vlsn = Vlsn(1);

    /// Creates a VLSN from its raw sequence number.
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null position.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the position following this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Vlsn {
    fn from(sequence: u64) -> Self {
        Self(sequence)
    }
}

impl fmt::Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
