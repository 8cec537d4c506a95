// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observable appliance status.

use crate::config::{PeerInstance, ReplConfig};
use crate::xlog::LogPosition;
use serde::{Deserialize, Serialize};

/// Snapshot reported to the cluster state oracle.
///
/// `config_applied` only flips true once the daemon has actually been
/// driven into `config`; readers never observe a half-applied transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub config: Option<ReplConfig>,
    pub config_applied: bool,
    pub running: bool,
    /// Newest applied replication-log position, when the daemon is up.
    pub log_position: Option<LogPosition>,
    pub user_exists: bool,
    pub read_write: bool,
    /// The downstream peer that has fully caught up, if any.
    pub synced_downstream: Option<PeerInstance>,
}
