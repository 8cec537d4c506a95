// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client surface of the in-container init process.
//!
//! The first process inside every container brokers stdio, ptys and state
//! signalling back to the host over a UNIX socket inside the rootfs. The
//! backend talks to it through [`InitClient`], produced by an
//! [`InitConnector`]; the production connector speaks the wire protocol in
//! [`wire`], tests substitute fakes.

use async_trait::async_trait;
use gantry_core::{Artifact, Port};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

#[cfg(test)]
pub(crate) mod fake;
pub mod wire;

/// Socket path inside the rootfs the init listens on.
pub const SOCKET_NAME: &str = ".containerinit.sock";

/// Config file inside the rootfs the init reads at startup.
pub const CONFIG_NAME: &str = ".containerconfig";

/// Errors from init-socket operations.
#[derive(Debug, Error)]
pub enum InitError {
    /// The init went away; for stop paths this means the stop worked.
    #[error("init disconnected")]
    Disconnected,

    #[error("init protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle state reported by the init over its state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InitState {
    /// Frozen before exec, waiting for a resume (and possibly an attach).
    Initial,
    Running,
    Exited { status: i32 },
    Failed { error: Option<String> },
}

impl InitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InitState::Exited { .. } | InitState::Failed { .. })
    }
}

/// Startup configuration written to [`CONFIG_NAME`] in the rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub file_artifacts: Vec<Artifact>,
    /// Container address in CIDR notation; absent for host networking.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

pub type InitReader = Box<dyn AsyncRead + Send + Unpin>;
pub type InitWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The three output streams the init exposes.
pub struct InitStreams {
    pub stdout: InitReader,
    pub stderr: InitReader,
    pub init_log: InitReader,
}

/// Live connection to a container's init.
#[async_trait]
pub trait InitClient: Send + Sync {
    /// Unfreeze the init (exec the payload, or let a terminal state settle).
    async fn resume(&self) -> Result<(), InitError>;

    /// Forward a signal to the container's payload process.
    async fn signal(&self, signal: i32) -> Result<(), InitError>;

    async fn resize_pty(&self, height: u16, width: u16) -> Result<(), InitError>;

    /// Duplex handle on the pty master (TTY jobs only).
    async fn get_pty(&self) -> Result<(InitReader, InitWriter), InitError>;

    /// Write end of the payload's stdin.
    async fn get_stdin(&self) -> Result<InitWriter, InitError>;

    async fn get_streams(&self) -> Result<InitStreams, InitError>;

    /// Subscribe to init state changes. The channel closing without a
    /// terminal state means the init went away unexpectedly.
    async fn stream_state(&self) -> Result<mpsc::Receiver<InitState>, InitError>;

    async fn close(&self);
}

/// Produces [`InitClient`]s from the init socket path.
#[async_trait]
pub trait InitConnector: Send + Sync {
    async fn connect(&self, socket: &Path) -> Result<Arc<dyn InitClient>, InitError>;
}
