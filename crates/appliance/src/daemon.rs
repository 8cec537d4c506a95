// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control surface over the database daemon process and its peers.

use crate::xlog::LogPosition;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::oneshot;

#[cfg(test)]
pub(crate) mod fake;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon command failed: {0}")]
    Command(String),

    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why the daemon process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// `stop` asked it to.
    Requested,
    /// It died on its own; the exit code when one was observable.
    Unexpected(Option<i32>),
}

/// Health snapshot of an upstream peer, used to gate standby startup.
#[derive(Debug, Clone, Default)]
pub struct UpstreamStatus {
    pub running: bool,
    pub position: LogPosition,
    pub user_exists: bool,
}

/// Everything the supervisor needs from the daemon: process lifecycle,
/// replication wiring, and position/credential queries on itself and its
/// peers. Tests swap in a scripted fake.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Spawn the daemon against the given config file. The returned channel
    /// resolves once the process exits.
    async fn start(&self, config_path: &Path) -> Result<oneshot::Receiver<DaemonExit>, DaemonError>;

    /// Terminate the daemon; the pending exit channel resolves `Requested`.
    async fn stop(&self) -> Result<(), DaemonError>;

    /// One direct connection attempt to the local daemon.
    async fn ping(&self) -> Result<(), DaemonError>;

    /// Initialise this node as the replica-set primary.
    async fn init_primary(&self) -> Result<(), DaemonError>;

    /// Point local replication at the upstream peer.
    async fn follow_upstream(&self, addr: &str) -> Result<(), DaemonError>;

    /// Newest applied position in the local replication log.
    async fn local_position(&self) -> Result<LogPosition, DaemonError>;

    /// Newest applied position of a peer.
    async fn peer_position(&self, addr: &str) -> Result<LogPosition, DaemonError>;

    /// Health of an upstream peer's database, via its appliance API.
    async fn upstream_status(&self, addr: &str) -> Result<UpstreamStatus, DaemonError>;

    async fn user_exists(&self) -> Result<bool, DaemonError>;

    async fn is_read_write(&self) -> Result<bool, DaemonError>;

    async fn set_read_write(&self, enabled: bool) -> Result<(), DaemonError>;
}

/// Daemon control over a real child process plus the engine's CLI client
/// for queries.
pub struct SystemDaemon {
    bin_dir: PathBuf,
    bin_name: String,
    port: u16,
    /// Set before an intentional shutdown so the exit monitor can tell a
    /// requested stop from a crash.
    stopping: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl SystemDaemon {
    pub fn new(bin_dir: impl Into<PathBuf>, bin_name: impl Into<String>, port: u16) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            bin_name: bin_name.into(),
            port,
            stopping: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Run the engine CLI against a node and return its trimmed stdout.
    async fn eval(&self, addr: &str, script: &str) -> Result<String, DaemonError> {
        let output = tokio::process::Command::new(self.bin_dir.join("mongo"))
            .arg("--quiet")
            .arg("--eval")
            .arg(script)
            .arg(addr)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DaemonError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn position_of(&self, addr: &str) -> Result<LogPosition, DaemonError> {
        let out = self
            .eval(
                addr,
                "var e = db.getSiblingDB('local')['oplog.rs'].find().sort({ts:-1}).limit(1).next(); \
                 print(e.ts.getTime() * 4294967296 + e.ts.getInc())",
            )
            .await?;
        let packed = out
            .parse::<u64>()
            .map_err(|_| DaemonError::Command(format!("bad oplog position: {out:?}")))?;
        Ok(LogPosition(packed))
    }
}

#[async_trait]
impl DaemonControl for SystemDaemon {
    async fn start(&self, config_path: &Path) -> Result<oneshot::Receiver<DaemonExit>, DaemonError> {
        let mut child = tokio::process::Command::new(self.bin_dir.join(&self.bin_name))
            .arg("--config")
            .arg(config_path)
            .spawn()?;
        self.stopping.store(false, std::sync::atomic::Ordering::SeqCst);

        let (exit_tx, exit_rx) = oneshot::channel();
        let stopping = self.stopping.clone();
        // The monitor task owns the child; `stop` only flips the flag and
        // asks the daemon to shut itself down.
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = if stopping.load(std::sync::atomic::Ordering::SeqCst) {
                DaemonExit::Requested
            } else {
                DaemonExit::Unexpected(status.ok().and_then(|s| s.code()))
            };
            let _ = exit_tx.send(exit);
        });
        Ok(exit_rx)
    }

    async fn stop(&self) -> Result<(), DaemonError> {
        self.stopping.store(true, std::sync::atomic::Ordering::SeqCst);
        // Ask politely over the CLI; the admin shutdown drops the connection.
        let _ = self.eval(&self.local_addr(), "db.adminCommand({shutdown: 1})").await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        tokio::net::TcpStream::connect(self.local_addr()).await?;
        Ok(())
    }

    async fn init_primary(&self) -> Result<(), DaemonError> {
        self.eval(&self.local_addr(), "rs.initiate()").await?;
        Ok(())
    }

    async fn follow_upstream(&self, addr: &str) -> Result<(), DaemonError> {
        self.eval(addr, &format!("rs.add('{}')", self.local_addr())).await?;
        Ok(())
    }

    async fn local_position(&self) -> Result<LogPosition, DaemonError> {
        self.position_of(&self.local_addr()).await
    }

    async fn peer_position(&self, addr: &str) -> Result<LogPosition, DaemonError> {
        self.position_of(addr).await
    }

    async fn upstream_status(&self, addr: &str) -> Result<UpstreamStatus, DaemonError> {
        let position = self.position_of(addr).await?;
        let users = self
            .eval(addr, "print(db.getSiblingDB('admin').system.users.count())")
            .await?;
        Ok(UpstreamStatus {
            running: true,
            position,
            user_exists: users.parse::<u64>().unwrap_or(0) > 0,
        })
    }

    async fn user_exists(&self) -> Result<bool, DaemonError> {
        let out = self
            .eval(
                &self.local_addr(),
                "print(db.getSiblingDB('admin').system.users.count())",
            )
            .await?;
        Ok(out.parse::<u64>().unwrap_or(0) > 0)
    }

    async fn is_read_write(&self) -> Result<bool, DaemonError> {
        let out = self.eval(&self.local_addr(), "print(db.isMaster().ismaster)").await?;
        Ok(out == "true")
    }

    async fn set_read_write(&self, enabled: bool) -> Result<(), DaemonError> {
        if enabled {
            self.eval(
                &self.local_addr(),
                "db.getMongo().setReadPref('primary')",
            )
            .await?;
        }
        Ok(())
    }
}
