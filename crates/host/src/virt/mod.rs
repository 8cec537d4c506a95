// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain descriptors and the virtualisation control plane surface.
//!
//! A domain is one container instance owned by the host's container
//! supervisor. The backend describes it with [`DomainSpec`] and drives it
//! through [`VirtControlPlane`]; the concrete control plane lives outside
//! this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;

/// 64 MiB tmpfs mounted at `/dev/shm` in every domain.
pub const SHM_BYTES: u64 = 64 * 1024 * 1024;

/// Default memory limit when the job requests none.
pub const DEFAULT_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Errors from the virtualisation control plane.
#[derive(Debug, Error)]
pub enum VirtError {
    /// The control plane daemon is temporarily unreachable; safe to retry.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    #[error("unknown domain {0}")]
    UnknownDomain(String),

    #[error("{0}")]
    Other(String),
}

impl VirtError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VirtError::Unavailable(_))
    }
}

/// Observable run state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    NoState,
    Running,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
}

impl DomainState {
    /// True while the domain still occupies its supervisor process.
    pub fn is_active(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Shutdown)
    }
}

/// Exit handling directive: exited domains are preserved so the watcher can
/// observe their final state before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitAction {
    Preserve,
    Destroy,
}

/// Bridged network interface attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInterface {
    pub bridge: String,
}

/// Complete description of a container domain, shaped after the control
/// plane's XML document: rootfs filesystem, RAM filesystem, one pty console,
/// optional bridged interface, resource partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Domain name; always the job ID.
    pub name: String,
    pub memory_bytes: u64,
    /// Path of the init binary executed as the domain's first process.
    pub init: PathBuf,
    /// Host directory mounted as the domain's `/`.
    pub root_path: PathBuf,
    /// Size of the `/dev/shm` RAM filesystem.
    pub shm_bytes: u64,
    /// Bridged interface; `None` for host networking.
    pub interface: Option<BridgeInterface>,
    /// Resource partition path, e.g. `/machine/user`.
    pub partition: String,
    /// cgroup cpu shares; `None` leaves the controller default.
    pub cpu_shares: Option<u64>,
    pub on_poweroff: ExitAction,
    pub on_crash: ExitAction,
}

impl DomainSpec {
    pub fn new(name: impl Into<String>, root_path: PathBuf, init: PathBuf) -> Self {
        Self {
            name: name.into(),
            memory_bytes: DEFAULT_MEMORY_BYTES,
            init,
            root_path,
            shm_bytes: SHM_BYTES,
            interface: None,
            partition: String::new(),
            cpu_shares: None,
            on_poweroff: ExitAction::Preserve,
            on_crash: ExitAction::Preserve,
        }
    }
}

/// Control plane operations the backend needs. Narrow by design; every
/// method is keyed by the UUID handed out by `define` except the network
/// management pair used during host network setup.
#[async_trait]
pub trait VirtControlPlane: Send + Sync {
    /// Register the domain and return its UUID.
    async fn define(&self, spec: &DomainSpec) -> Result<String, VirtError>;

    /// Start a defined domain.
    async fn create(&self, uuid: &str) -> Result<(), VirtError>;

    /// Force-terminate a domain and release its supervisor.
    async fn destroy(&self, uuid: &str) -> Result<(), VirtError>;

    async fn state(&self, uuid: &str) -> Result<DomainState, VirtError>;

    /// PID of the domain's supervisor process, for mount-namespace hygiene.
    async fn supervisor_pid(&self, uuid: &str) -> Result<Option<i32>, VirtError>;

    /// Make the named bridge network known to the control plane.
    async fn ensure_network(&self, bridge: &str) -> Result<(), VirtError>;

    /// Destroy a competing control-plane network (the stock default network
    /// binds a resolver to every interface, which breaks service discovery).
    async fn destroy_network(&self, name: &str) -> Result<(), VirtError>;
}
