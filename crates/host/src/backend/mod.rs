// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The container backend: runs, supervises and tears down container jobs.

pub mod attach;
pub mod cgroup;
pub mod container;
pub mod mounts;
pub mod network;
pub mod persist;
pub mod run;

#[cfg(test)]
pub(crate) mod test_helpers;

use crate::adapters::{DiscoveryClient, ImageStore, LogMux, LogStreamHandle, VolumeManager};
use crate::conf::HostConfig;
use crate::error::BackendError;
use crate::init::InitConnector;
use crate::net::IpAllocator;
use crate::state::HostState;
use crate::virt::VirtControlPlane;
use container::Container;
use gantry_core::LogStreamId;
use mounts::Mounter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use attach::{AttachExit, AttachRequest};
pub use run::RunConfig;

/// How long to wait after SIGTERM before escalating to SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the backend is constructed over.
pub struct BackendDeps {
    pub images: Arc<dyn ImageStore>,
    pub volumes: Arc<dyn VolumeManager>,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub mux: Arc<dyn LogMux>,
    pub virt: Arc<dyn VirtControlPlane>,
    pub init: Arc<dyn InitConnector>,
    pub mounter: Arc<dyn Mounter>,
}

/// Bridge network state installed by `configure_networking`.
pub(crate) struct NetworkState {
    pub bridge_addr: Ipv4Addr,
    pub prefix: u8,
    /// The configured CIDR, kept for error messages and NAT rules.
    pub subnet: String,
    pub alloc: IpAllocator,
}

/// Host-local container backend.
///
/// One instance per host. All public operations are safe to call
/// concurrently; each running container is supervised by its own watcher
/// task which owns the container's lifecycle after `run` returns.
pub struct ContainerBackend {
    pub(crate) conf: HostConfig,
    pub(crate) state: Arc<HostState>,
    pub(crate) deps: BackendDeps,

    pub(crate) containers: RwLock<HashMap<String, Arc<Container>>>,
    pub(crate) log_streams:
        Mutex<HashMap<String, HashMap<LogStreamId, Box<dyn LogStreamHandle>>>>,
    pub(crate) default_env: RwLock<HashMap<String, String>>,

    pub(crate) network: Mutex<Option<NetworkState>>,
    /// Resolver file bound into containers; replaced once networking is up.
    pub(crate) resolv_conf: Mutex<PathBuf>,

    network_ready_tx: watch::Sender<bool>,
    discoverd_ready_tx: watch::Sender<bool>,
}

impl ContainerBackend {
    /// Build the backend and create the configured cgroup partitions.
    pub fn new(
        state: Arc<HostState>,
        conf: HostConfig,
        deps: BackendDeps,
    ) -> Result<Self, BackendError> {
        for (name, shares) in &conf.partitions {
            cgroup::create_partition(&conf.cgroup_root, name, *shares)?;
        }

        let (network_ready_tx, _) = watch::channel(false);
        let (discoverd_ready_tx, _) = watch::channel(false);
        let resolv_conf = Mutex::new(conf.resolv_conf.clone());
        Ok(Self {
            conf,
            state,
            deps,
            containers: RwLock::new(HashMap::new()),
            log_streams: Mutex::new(HashMap::new()),
            default_env: RwLock::new(HashMap::new()),
            network: Mutex::new(None),
            resolv_conf,
            network_ready_tx,
            discoverd_ready_tx,
        })
    }

    /// Inject host-provided env merged into every container.
    ///
    /// Setting `DISCOVERD` additionally unblocks runs that wait for service
    /// discovery to become available.
    pub fn set_default_env(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let is_discoverd = key == "DISCOVERD";
        self.default_env.write().insert(key, value.into());
        if is_discoverd {
            self.discoverd_ready_tx.send_replace(true);
        }
    }

    pub fn job_exists(&self, id: &str) -> bool {
        self.containers.read().contains_key(id)
    }

    pub(crate) fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.containers.read().get(id).cloned()
    }

    pub(crate) fn require_container(&self, id: &str) -> Result<Arc<Container>, BackendError> {
        self.container(id).ok_or_else(|| BackendError::UnknownContainer(id.to_string()))
    }

    /// Stop a job: SIGTERM, and SIGKILL if it hasn't exited within
    /// [`STOP_TIMEOUT`]. Idempotent; a job already terminal is a no-op.
    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<(), BackendError> {
        if let Some(job) = self.state.get_job(id) {
            if job.status.is_terminal() {
                return Ok(());
            }
        }
        match self.container(id) {
            Some(container) => container.stop(self).await,
            None => Err(BackendError::UnknownContainer(id.to_string())),
        }
    }

    /// Forward a signal to the job's payload process.
    pub async fn signal(&self, id: &str, signal: i32) -> Result<(), BackendError> {
        let container = self.require_container(id)?;
        let client = container.client().ok_or(BackendError::JobNotRunning)?;
        client.signal(signal).await?;
        Ok(())
    }

    /// Resize the pty of a TTY job.
    pub async fn resize_tty(&self, id: &str, height: u16, width: u16) -> Result<(), BackendError> {
        let container = self.require_container(id)?;
        if !container.job.config.tty {
            return Err(BackendError::NoTty);
        }
        let client = container.client().ok_or(BackendError::JobNotRunning)?;
        client.resize_pty(height, width).await?;
        Ok(())
    }

    /// Stop every container not in the allow-list, concurrently. Returns the
    /// first error encountered after all stops have finished.
    pub async fn cleanup(self: &Arc<Self>, except: &[String]) -> Result<(), BackendError> {
        let ids: Vec<String> = {
            let containers = self.containers.read();
            containers.keys().filter(|id| !except.contains(id)).cloned().collect()
        };
        tracing::info!(count = ids.len(), "starting cleanup");

        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let backend = self.clone();
            tasks.spawn(async move {
                tracing::info!(job.id = %id, "stopping job");
                backend.stop(&id).await
            });
        }

        let mut first_err = None;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "error stopping job");
                    first_err.get_or_insert(err);
                }
                Ok(Ok(())) => {}
                Err(join_err) => {
                    tracing::error!(error = %join_err, "stop task panicked");
                }
            }
        }
        tracing::info!("finished cleanup");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until `configure_networking` has completed.
    pub(crate) async fn wait_network_configured(&self) {
        let mut rx = self.network_ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Block until the discovery URL has been injected via
    /// `set_default_env("DISCOVERD", ..)`.
    pub(crate) async fn wait_discoverd_configured(&self) {
        let mut rx = self.discoverd_ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub(crate) fn mark_network_configured(&self) {
        self.network_ready_tx.send_replace(true);
    }

    /// Release a container address back to the bridge pool.
    pub(crate) fn release_ip(&self, ip: Ipv4Addr) {
        if let Some(net) = self.network.lock().as_mut() {
            net.alloc.release(ip);
        }
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
