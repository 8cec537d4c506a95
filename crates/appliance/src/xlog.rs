// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replication log positions.

use serde::{Deserialize, Serialize};

/// Opaque, totally ordered position in the replication log.
///
/// The packed representation is whatever the daemon reports (for the stock
/// engine, a 32-bit epoch second and a 32-bit ordinal packed into one u64);
/// this type only ever compares them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    /// The position before any log entry; replicas start here.
    pub const ZERO: LogPosition = LogPosition(0);

    pub fn is_zero(&self) -> bool {
        *self == LogPosition::ZERO
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[path = "xlog_tests.rs"]
mod tests;
