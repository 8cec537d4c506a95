// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replication roles and peer configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key carrying a peer's stable datastore identity. Peers are
/// compared by this, not by address, because addresses move across restarts.
pub const META_ID_KEY: &str = "DATASTORE_ID";

/// Role this node plays in the replication chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Primary,
    Sync,
    Async,
}

gantry_core::simple_display! {
    Role {
        None => "none",
        Primary => "primary",
        Sync => "sync",
        Async => "async",
    }
}

/// A peer in the replication chain, as the cluster oracle describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInstance {
    pub addr: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl PeerInstance {
    pub fn new(addr: impl Into<String>, id: impl Into<String>) -> Self {
        let mut meta = HashMap::new();
        meta.insert(META_ID_KEY.to_string(), id.into());
        Self { addr: addr.into(), meta }
    }

    /// Stable identity of the peer, when the oracle supplied one.
    pub fn datastore_id(&self) -> Option<&str> {
        self.meta.get(META_ID_KEY).map(String::as_str)
    }
}

fn same_peer(a: &Option<PeerInstance>, b: &Option<PeerInstance>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.datastore_id() == b.datastore_id(),
        _ => false,
    }
}

/// A replication assignment from the cluster state oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplConfig {
    pub role: Role,
    pub upstream: Option<PeerInstance>,
    pub downstream: Option<PeerInstance>,
}

impl ReplConfig {
    pub fn primary(downstream: Option<PeerInstance>) -> Self {
        Self { role: Role::Primary, upstream: None, downstream }
    }

    pub fn standby(role: Role, upstream: PeerInstance, downstream: Option<PeerInstance>) -> Self {
        Self { role, upstream: Some(upstream), downstream }
    }

    /// Whether two assignments are the same chain position: same role and
    /// the same peers by identity.
    pub fn equivalent(&self, other: &ReplConfig) -> bool {
        self.role == other.role
            && same_peer(&self.upstream, &other.upstream)
            && same_peer(&self.downstream, &other.downstream)
    }

    /// Whether `new` only swaps this node's downstream: same role, same
    /// upstream, a different (present) downstream.
    pub fn is_new_downstream(&self, new: &ReplConfig) -> bool {
        self.role == new.role
            && same_peer(&self.upstream, &new.upstream)
            && new.downstream.is_some()
            && !same_peer(&self.downstream, &new.downstream)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
