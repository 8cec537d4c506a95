// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job request model and per-host job lifecycle state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Default cgroup partition for jobs that don't request one.
pub const DEFAULT_PARTITION: &str = "user";

/// An image or file artifact referenced by URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub uri: String,
}

impl Artifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// Transport protocol for an exposed port.
///
/// Unrecognised protocols deserialize to `Unknown` and are rejected when the
/// job is started, not at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProto {
    Tcp,
    Udp,
    #[serde(other)]
    Unknown,
}

crate::simple_display! {
    PortProto {
        Tcp => "tcp",
        Udp => "udp",
        Unknown => "unknown",
    }
}

/// A port the job asks to expose. `port == 0` requests backend assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub proto: PortProto,
    pub port: u16,
}

/// A host path bind-mounted into the container rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path to bind from.
    pub target: String,
    /// Path inside the rootfs to bind to.
    pub location: String,
    #[serde(default)]
    pub writeable: bool,
}

/// A managed volume bind-mounted into the container rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub volume_id: String,
    /// Path inside the rootfs to bind to.
    pub target: String,
    #[serde(default)]
    pub writeable: bool,
}

/// Process configuration carried by a job request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub disable_log: bool,
    #[serde(default)]
    pub host_network: bool,
}

/// Resource limits for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    /// CPU limit in milli-CPUs (1000 = one full CPU).
    pub cpu: Option<u64>,
}

/// An immutable request to run one containerised process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// cgroup partition bucket; defaults to [`DEFAULT_PARTITION`] when empty.
    #[serde(default)]
    pub partition: String,
    pub image_artifact: Artifact,
    #[serde(default)]
    pub file_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Job {
    /// Hostname the container sees: the segment of the job ID after the first
    /// `-` (host-qualified IDs carry the host as prefix), truncated to 64.
    pub fn container_hostname(&self) -> &str {
        let name = match self.id.split_once('-') {
            Some((_, rest)) => rest,
            None => &self.id,
        };
        if name.len() > 64 {
            &name[..64]
        } else {
            name
        }
    }
}

/// Lifecycle status of a job on this host.
///
/// Advances monotonically `Starting → Running → (Done | Crashed | Failed)`.
/// Terminal statuses are written exactly once; later writes are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Running,
    Done,
    Crashed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Crashed | JobStatus::Failed)
    }
}

crate::simple_display! {
    JobStatus {
        Starting => "starting",
        Running => "running",
        Done => "done",
        Crashed => "crashed",
        Failed => "failed",
    }
}

/// Registry entry for a job on this host.
///
/// Always handed out by value; the registry never leaks references to its
/// internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job: Job,
    pub status: JobStatus,
    pub container_id: Option<String>,
    pub internal_ip: Option<Ipv4Addr>,
    pub exit_status: Option<i32>,
    pub error: Option<String>,
    #[serde(default)]
    pub force_stop: bool,
    pub started_at_ms: u64,
}

impl ActiveJob {
    pub fn new(job: Job, started_at_ms: u64) -> Self {
        Self {
            job,
            status: JobStatus::Starting,
            container_id: None,
            internal_ip: None,
            exit_status: None,
            error: None,
            force_stop: false,
            started_at_ms,
        }
    }
}

crate::builder! {
    pub struct JobBuilder => Job {
        into {
            id: String = "host0-testjob",
            partition: String = "",
        }
        set {
            image_artifact: Artifact = Artifact::new("https://registry.test/image"),
            file_artifacts: Vec<Artifact> = Vec::new(),
            config: JobConfig = JobConfig::default(),
            resources: Resources = Resources::default(),
            metadata: HashMap<String, String> = HashMap::new(),
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
