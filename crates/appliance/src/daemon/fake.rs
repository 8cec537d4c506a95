// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted fake daemon for supervisor tests.

use super::{DaemonControl, DaemonError, DaemonExit, UpstreamStatus};
use crate::xlog::LogPosition;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::oneshot;

#[derive(Default)]
pub struct FakeDaemon {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    running: AtomicBool,
    exit_tx: Mutex<Option<oneshot::Sender<DaemonExit>>>,

    pub local_pos: Mutex<LogPosition>,
    peer_pos: Mutex<HashMap<String, LogPosition>>,
    upstreams: Mutex<HashMap<String, UpstreamStatus>>,

    pub followed: Mutex<Vec<String>>,
    pub inits: AtomicUsize,
    read_write: AtomicBool,
    pub user_exists: AtomicBool,
    pub config_paths: Mutex<Vec<PathBuf>>,
}

impl FakeDaemon {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_local_position(&self, pos: LogPosition) {
        *self.local_pos.lock() = pos;
    }

    pub fn set_peer_position(&self, addr: &str, pos: LogPosition) {
        self.peer_pos.lock().insert(addr.to_string(), pos);
    }

    pub fn set_upstream(&self, addr: &str, status: UpstreamStatus) {
        self.upstreams.lock().insert(addr.to_string(), status);
    }

    pub fn read_write(&self) -> bool {
        self.read_write.load(Ordering::SeqCst)
    }

    /// Kill the daemon out from under the supervisor.
    pub fn crash(&self, code: i32) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(DaemonExit::Unexpected(Some(code)));
        }
    }
}

#[async_trait]
impl DaemonControl for FakeDaemon {
    async fn start(&self, config_path: &Path) -> Result<oneshot::Receiver<DaemonExit>, DaemonError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.config_paths.lock().push(config_path.to_path_buf());
        let (tx, rx) = oneshot::channel();
        *self.exit_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DaemonError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(DaemonExit::Requested);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DaemonError::NotRunning)
        }
    }

    async fn init_primary(&self) -> Result<(), DaemonError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        // Primary initialisation provisions the replication user.
        self.user_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn follow_upstream(&self, addr: &str) -> Result<(), DaemonError> {
        self.followed.lock().push(addr.to_string());
        Ok(())
    }

    async fn local_position(&self) -> Result<LogPosition, DaemonError> {
        if !self.is_running() {
            return Err(DaemonError::NotRunning);
        }
        Ok(*self.local_pos.lock())
    }

    async fn peer_position(&self, addr: &str) -> Result<LogPosition, DaemonError> {
        self.peer_pos.lock().get(addr).copied().ok_or_else(|| {
            DaemonError::PeerUnreachable {
                addr: addr.to_string(),
                reason: "no such peer".to_string(),
            }
        })
    }

    async fn upstream_status(&self, addr: &str) -> Result<UpstreamStatus, DaemonError> {
        self.upstreams.lock().get(addr).cloned().ok_or_else(|| {
            DaemonError::PeerUnreachable {
                addr: addr.to_string(),
                reason: "no such peer".to_string(),
            }
        })
    }

    async fn user_exists(&self) -> Result<bool, DaemonError> {
        Ok(self.user_exists.load(Ordering::SeqCst))
    }

    async fn is_read_write(&self) -> Result<bool, DaemonError> {
        Ok(self.read_write.load(Ordering::SeqCst))
    }

    async fn set_read_write(&self, enabled: bool) -> Result<(), DaemonError> {
        self.read_write.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
