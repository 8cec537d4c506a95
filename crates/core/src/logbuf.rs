// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log tail buffers carried across host restarts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies one of the three streams the in-container init exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStreamId {
    Stdout,
    Stderr,
    InitLog,
}

impl LogStreamId {
    /// Numeric stream ID used by the log multiplexer wire format.
    pub fn wire_id(&self) -> u8 {
        match self {
            LogStreamId::Stdout => 1,
            LogStreamId::Stderr => 2,
            LogStreamId::InitLog => 3,
        }
    }

    pub const ALL: [LogStreamId; 3] =
        [LogStreamId::Stdout, LogStreamId::Stderr, LogStreamId::InitLog];
}

crate::simple_display! {
    LogStreamId {
        Stdout => "stdout",
        Stderr => "stderr",
        InitLog => "init_log",
    }
}

/// Bounded tail of each stream of one job, captured when its log follower
/// closes and re-seeded into the next follower so no line is lost.
pub type LogBuffer = HashMap<LogStreamId, Vec<u8>>;

/// Tails for every job on the host, keyed by job ID.
pub type LogBuffers = HashMap<String, LogBuffer>;
