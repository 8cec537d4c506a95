// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test harness: a backend wired entirely to fakes.

use super::{BackendDeps, ContainerBackend};
use crate::adapters::{
    FakeDiscovery, FakeImageStore, FakeLogMux, FakeMounter, FakeVolumeManager,
};
use crate::conf::HostConfig;
use crate::init::fake::{FakeInitClient, FakeInitConnector};
use crate::init::InitState;
use crate::state::HostState;
use crate::virt::fake::FakeVirt;
use gantry_core::{FakeClock, Job};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct Harness {
    pub backend: Arc<ContainerBackend>,
    pub state: Arc<HostState>,
    pub images: Arc<FakeImageStore>,
    pub volumes: Arc<FakeVolumeManager>,
    pub discovery: Arc<FakeDiscovery>,
    pub mux: Arc<FakeLogMux>,
    pub virt: Arc<FakeVirt>,
    pub init: Arc<FakeInitConnector>,
    pub mounter: Arc<FakeMounter>,
    _dirs: tempfile::TempDir,
}

pub(crate) const TEST_SUBNET: &str = "100.100.0.1/24";

/// A backend over fakes with networking and discovery already configured.
pub(crate) fn harness() -> Harness {
    let h = bare_harness();
    h.backend.configure_test_network(TEST_SUBNET);
    h.backend.set_default_env("DISCOVERD", "http://100.100.0.1:1111");
    h
}

/// A backend over fakes with the startup barriers still closed.
pub(crate) fn bare_harness() -> Harness {
    let dirs = tempfile::tempdir().expect("tempdir");
    let cgroup_root = dirs.path().join("cgroup");
    std::fs::create_dir_all(cgroup_root.join("cpuset")).unwrap();
    std::fs::write(cgroup_root.join("cpuset/cpuset.cpus"), "0-3").unwrap();
    std::fs::write(cgroup_root.join("cpuset/cpuset.mems"), "0").unwrap();

    let mut partitions = HashMap::new();
    partitions.insert("user".to_string(), 1024);
    partitions.insert("system".to_string(), 2048);

    let conf = HostConfig {
        state_dir: dirs.path().join("state"),
        image_dir: dirs.path().join("images"),
        init_path: dirs.path().join("gantry-init"),
        umount_helper: dirs.path().join("gantry-nsumount"),
        bridge_name: "gantrybr0".to_string(),
        resolv_conf: dirs.path().join("resolv.conf"),
        cgroup_root,
        partitions,
    };
    std::fs::write(&conf.resolv_conf, "nameserver 1.1.1.1\n").unwrap();

    let state = Arc::new(HostState::new("host0", Arc::new(FakeClock::new())));
    let images = Arc::new(FakeImageStore::new());
    let volumes = Arc::new(FakeVolumeManager::default());
    let discovery = Arc::new(FakeDiscovery::default());
    let mux = Arc::new(FakeLogMux::default());
    let virt = Arc::new(FakeVirt::default());
    let init = Arc::new(FakeInitConnector::default());
    let mounter = Arc::new(FakeMounter::default());

    let backend = Arc::new(
        ContainerBackend::new(
            state.clone(),
            conf,
            BackendDeps {
                images: images.clone(),
                volumes: volumes.clone(),
                discovery: discovery.clone(),
                mux: mux.clone(),
                virt: virt.clone(),
                init: init.clone(),
                mounter: mounter.clone(),
            },
        )
        .expect("backend construction"),
    );

    Harness {
        backend,
        state,
        images,
        volumes,
        discovery,
        mux,
        virt,
        init,
        mounter,
        _dirs: dirs,
    }
}

impl Harness {
    pub fn job(&self, id: &str) -> Job {
        Job::builder().id(id).build()
    }

    /// Register and run a job, returning the scripted init client backing
    /// its watcher.
    pub async fn run_job(&self, job: Job) -> Arc<FakeInitClient> {
        let client = self.init.register(&job.id);
        self.state.add_job(&job);
        self.backend.run(job, Default::default()).await.expect("run");
        client
    }

    /// Run a job and drive it to `running`.
    pub async fn start_job(&self, job: Job) -> Arc<FakeInitClient> {
        let id = job.id.clone();
        let client = self.run_job(job).await;
        client.send_state(InitState::Running).await;
        self.wait_for_status(&id, gantry_core::JobStatus::Running).await;
        client
    }

    /// Block until the registry reports `status` for the job.
    pub async fn wait_for_status(&self, id: &str, status: gantry_core::JobStatus) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        loop {
            if self.state.get_job(id).map(|j| j.status) == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {id} to reach {status}"
            );
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Block until the watcher has connected and registered the container.
    pub async fn wait_for_registration(&self, id: &str) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        while !self.backend.job_exists(id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {id} registration"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Block until the watcher has deregistered the container.
    pub async fn wait_for_teardown(&self, id: &str) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        while self.backend.job_exists(id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {id} teardown"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn allocated_ips(&self) -> usize {
        // The bridge address is always pinned.
        self.backend
            .network
            .lock()
            .as_ref()
            .map(|net| net.alloc.allocated_count() - 1)
            .unwrap_or(0)
    }
}
