// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Role-driven supervisor for the database daemon.
//!
//! One transition at a time: `reconfigure`, `start` and `stop` serialise on
//! an operation lock, while status readers observe an atomically published
//! snapshot and never block a transition.

use crate::config::{PeerInstance, ReplConfig, Role};
use crate::daemon::{DaemonControl, DaemonExit};
use crate::status::DatabaseInfo;
use crate::xlog::LogPosition;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Poll interval for upstream readiness and catch-up checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for an upstream to come online. Of the order of the
/// discovery heartbeat, to avoid waiting on an upstream that is gone.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPL_TIMEOUT: Duration = Duration::from_secs(60);

/// Config file rendered into the data directory for the daemon.
pub const CONFIG_NAME: &str = "daemon.conf";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process already running")]
    AlreadyRunning,

    #[error("process already stopped")]
    AlreadyStopped,

    #[error("unconfigured process")]
    Unconfigured,

    #[error("start attempted with role 'none'")]
    NoneRole,

    #[error("missing downstream peer")]
    MissingDownstream,

    #[error("missing upstream peer")]
    MissingUpstream,

    #[error("upstream is offline")]
    UpstreamOffline,

    #[error("timed out waiting for daemon to start")]
    StartTimeout,

    #[error("unable to stop daemon in time")]
    StopTimeout,

    #[error("unexpected state: daemon already running as {role}")]
    UnexpectedState { role: Role },

    #[error(transparent)]
    Daemon(#[from] crate::daemon::DaemonError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handshake event telling the cluster oracle the appliance is up.
#[derive(Debug, Clone, Default)]
pub struct DatabaseEvent;

/// Host shutdown surface. The production implementation terminates the
/// process; tests observe the request instead.
pub trait Shutdown: Send + Sync {
    fn exit_with_code(&self, code: i32);
}

/// Terminates the host process, handing the replacement decision to the
/// cluster controller.
pub struct HostShutdown;

impl Shutdown for HostShutdown {
    fn exit_with_code(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Static appliance configuration.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub id: String,
    /// Single-node deployments have no replication chain to manage.
    pub singleton: bool,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub op_timeout: Duration,
    pub repl_timeout: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            singleton: false,
            port: 27017,
            data_dir: PathBuf::from("/data"),
            password: String::new(),
            op_timeout: DEFAULT_OP_TIMEOUT,
            repl_timeout: DEFAULT_REPL_TIMEOUT,
        }
    }
}

impl ProcessConfig {
    gantry_core::setters! {
        into {
            id: String,
            data_dir: PathBuf,
            password: String,
        }
        set {
            singleton: bool,
            port: u16,
            op_timeout: Duration,
            repl_timeout: Duration,
        }
    }
}

/// Published snapshot readers observe without blocking transitions.
#[derive(Default)]
struct Shared {
    config: Option<ReplConfig>,
    config_applied: bool,
    running: bool,
    synced_downstream: Option<PeerInstance>,
}

/// A cancelable catch-up wait: closing `stop` exactly once and waiting on
/// `done` makes cancellation idempotent and synchronous.
struct SyncWait {
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// The appliance supervisor.
pub struct Process {
    conf: ProcessConfig,
    daemon: Arc<dyn DaemonControl>,
    shutdown: Arc<dyn Shutdown>,

    op_lock: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
    sync_wait: tokio::sync::Mutex<Option<SyncWait>>,
    events_rx: Mutex<Option<mpsc::Receiver<DatabaseEvent>>>,
}

impl Process {
    pub fn new(
        conf: ProcessConfig,
        daemon: Arc<dyn DaemonControl>,
        shutdown: Arc<dyn Shutdown>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1);
        let _ = events_tx.try_send(DatabaseEvent);
        Self {
            conf,
            daemon,
            shutdown,
            op_lock: tokio::sync::Mutex::new(()),
            shared: Mutex::new(Shared::default()),
            sync_wait: tokio::sync::Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Channel the cluster oracle reads its startup handshake from. Yields
    /// the receiver once.
    pub fn ready(&self) -> Option<mpsc::Receiver<DatabaseEvent>> {
        self.events_rx.lock().take()
    }

    pub fn running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn config_path(&self) -> PathBuf {
        self.conf.data_dir.join(CONFIG_NAME)
    }

    /// Apply a replication assignment from the cluster oracle.
    ///
    /// While stopped this only records the assignment; `start` performs it.
    pub async fn reconfigure(self: &Arc<Self>, config: ReplConfig) -> Result<(), ProcessError> {
        let _guard = self.op_lock.lock().await;

        match config.role {
            Role::Primary => {
                if !self.conf.singleton && config.downstream.is_none() {
                    return Err(ProcessError::MissingDownstream);
                }
            }
            Role::Sync | Role::Async => {
                if config.upstream.is_none() {
                    return Err(ProcessError::MissingUpstream);
                }
            }
            Role::None => {}
        }

        if !self.running() {
            let mut shared = self.shared.lock();
            shared.config = Some(config);
            shared.config_applied = false;
            return Ok(());
        }

        self.apply(Some(config)).await
    }

    /// Start the daemon into the recorded assignment.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        let _guard = self.op_lock.lock().await;

        if self.running() {
            return Err(ProcessError::AlreadyRunning);
        }
        let config = self.shared.lock().config.clone();
        let Some(config) = config else {
            return Err(ProcessError::Unconfigured);
        };
        if config.role == Role::None {
            return Err(ProcessError::NoneRole);
        }

        self.apply(None).await
    }

    /// Stop the daemon.
    pub async fn stop(self: &Arc<Self>) -> Result<(), ProcessError> {
        let _guard = self.op_lock.lock().await;

        if !self.running() {
            return Err(ProcessError::AlreadyStopped);
        }
        self.do_stop().await
    }

    /// Status snapshot for the oracle. Never blocks a transition and never
    /// panics; query failures degrade to absent/false fields.
    pub async fn info(&self) -> DatabaseInfo {
        let (config, config_applied, running, synced_downstream) = {
            let shared = self.shared.lock();
            (
                shared.config.clone(),
                shared.config_applied,
                shared.running,
                shared.synced_downstream.clone(),
            )
        };

        let mut info = DatabaseInfo {
            config,
            config_applied,
            running,
            synced_downstream,
            ..DatabaseInfo::default()
        };
        if running {
            info.log_position = self.daemon.local_position().await.ok();
            info.user_exists = self.daemon.user_exists().await.unwrap_or(false);
            info.read_write = self.daemon.is_read_write().await.unwrap_or(false);
        }
        info
    }

    pub async fn log_position(&self) -> Result<LogPosition, ProcessError> {
        Ok(self.daemon.local_position().await?)
    }

    /// The transition core, mirroring one `Reconfigure` decision. `config`
    /// is `None` when starting into the recorded assignment.
    async fn apply(self: &Arc<Self>, config: Option<ReplConfig>) -> Result<(), ProcessError> {
        self.transition(&config).await?;

        let mut shared = self.shared.lock();
        if let Some(config) = config {
            shared.config = Some(config);
        }
        shared.config_applied = true;
        Ok(())
    }

    async fn transition(self: &Arc<Self>, config: &Option<ReplConfig>) -> Result<(), ProcessError> {
        if let Some(new) = config {
            if new.role == Role::None {
                tracing::info!(reason = "null role", "nothing to do");
                return Ok(());
            }
        }

        let (current, applied) = {
            let shared = self.shared.lock();
            (shared.config.clone(), shared.config_applied)
        };

        if applied {
            if let (Some(current), Some(new)) = (&current, config) {
                if new.equivalent(current) {
                    tracing::info!(reason = "config already applied", "nothing to do");
                    return Ok(());
                }
                // async → sync against the same upstream is bookkeeping only.
                if self.running()
                    && current.role == Role::Async
                    && new.role == Role::Sync
                    && match (&current.upstream, &new.upstream) {
                        (Some(a), Some(b)) => a.datastore_id() == b.datastore_id(),
                        _ => false,
                    }
                {
                    tracing::info!(
                        reason = "becoming sync with same upstream",
                        "nothing to do"
                    );
                    return Ok(());
                }
            }
        }

        // Never keep waiting for a stale downstream while reconfiguring.
        self.cancel_sync_wait().await;
        self.shared.lock().synced_downstream = None;

        if self.running() {
            if let (Some(current), Some(new)) = (&current, config) {
                if current.is_new_downstream(new) {
                    if let Some(downstream) = new.downstream.clone() {
                        tracing::info!(to = %downstream.addr, "downstream changed");
                        self.spawn_sync_wait(downstream, false).await;
                    }
                    return Ok(());
                }
            }
        }

        let effective = config.clone().or(current).ok_or(ProcessError::Unconfigured)?;
        if effective.role == Role::Primary {
            self.assume_primary(effective.downstream).await
        } else {
            let upstream = effective.upstream.ok_or(ProcessError::MissingUpstream)?;
            self.assume_standby(upstream, effective.downstream).await
        }
    }

    async fn assume_primary(
        self: &Arc<Self>,
        downstream: Option<PeerInstance>,
    ) -> Result<(), ProcessError> {
        if self.running() {
            let role = self.shared.lock().config.as_ref().map(|c| c.role);
            if role == Some(Role::Sync) {
                // Promotion: the daemon keeps running; writes open up once
                // the downstream has caught up.
                tracing::info!("promoting to primary");
                if let Some(downstream) = downstream {
                    self.spawn_sync_wait(downstream, true).await;
                }
                return Ok(());
            }
            return Err(ProcessError::UnexpectedState {
                role: role.unwrap_or(Role::None),
            });
        }

        tracing::info!("starting as primary");
        self.write_config().await?;
        self.start_daemon().await?;

        if let Err(err) = self.daemon.init_primary().await {
            tracing::error!(error = %err, "error initialising primary");
            if let Err(stop_err) = self.do_stop().await {
                tracing::debug!(error = %stop_err, "ignoring error stopping daemon");
            }
            return Err(err.into());
        }

        if let Some(downstream) = downstream {
            self.spawn_sync_wait(downstream, true).await;
        }
        Ok(())
    }

    async fn assume_standby(
        self: &Arc<Self>,
        upstream: PeerInstance,
        downstream: Option<PeerInstance>,
    ) -> Result<(), ProcessError> {
        tracing::info!(upstream = %upstream.addr, "starting up as standby");
        self.write_config().await?;

        if self.running() {
            self.do_stop().await?;
        } else {
            self.wait_for_upstream(&upstream).await?;
        }

        self.start_daemon().await?;
        self.daemon.follow_upstream(&upstream.addr).await?;

        if let Some(downstream) = downstream {
            self.spawn_sync_wait(downstream, false).await;
        }
        Ok(())
    }

    /// Spawn the daemon and wait until it accepts a direct connection, up
    /// to the operation timeout. A daemon that dies spontaneously afterwards
    /// takes the host down with exit code 1; the cluster controller will
    /// reschedule.
    async fn start_daemon(self: &Arc<Self>) -> Result<(), ProcessError> {
        tracing::info!(id = %self.conf.id, port = self.conf.port, "starting daemon");
        let exit_rx = self.daemon.start(&self.config_path()).await?;
        self.shared.lock().running = true;

        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(DaemonExit::Unexpected(code)) = exit_rx.await {
                tracing::error!(?code, "daemon unexpectedly exited");
                this.shared.lock().running = false;
                this.shutdown.exit_with_code(1);
            }
        });

        tracing::debug!("waiting for daemon to accept connections");
        let deadline = tokio::time::Instant::now() + self.conf.op_timeout;
        loop {
            match self.daemon.ping().await {
                Ok(()) => {
                    tracing::debug!("daemon started");
                    return Ok(());
                }
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::error!(error = %err, "timed out waiting for daemon to start");
                        if let Err(stop_err) = self.do_stop().await {
                            tracing::error!(error = %stop_err, "error stopping daemon");
                        }
                        return Err(ProcessError::StartTimeout);
                    }
                    tracing::debug!(error = %err, "ignoring error connecting to daemon");
                    tokio::time::sleep(CHECK_INTERVAL).await;
                }
            }
        }
    }

    async fn do_stop(self: &Arc<Self>) -> Result<(), ProcessError> {
        tracing::info!("stopping daemon");
        self.cancel_sync_wait().await;

        match tokio::time::timeout(self.conf.op_timeout, self.daemon.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "error stopping daemon");
            }
            Err(_) => return Err(ProcessError::StopTimeout),
        }
        self.shared.lock().running = false;
        Ok(())
    }

    /// Poll the upstream's appliance API until its database is running with
    /// a non-zero log position and a provisioned replication user.
    async fn wait_for_upstream(&self, upstream: &PeerInstance) -> Result<(), ProcessError> {
        tracing::info!(upstream = %upstream.addr, "waiting for upstream to come online");
        let deadline = tokio::time::Instant::now() + UPSTREAM_TIMEOUT;
        loop {
            match self.daemon.upstream_status(&upstream.addr).await {
                Ok(status) => {
                    tracing::info!(
                        running = status.running,
                        position = %status.position,
                        user_exists = status.user_exists,
                        "upstream status"
                    );
                    if status.running && !status.position.is_zero() && status.user_exists {
                        tracing::info!("upstream is online");
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "error getting upstream status");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::error!("upstream did not come online in time");
                return Err(ProcessError::UpstreamOffline);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Launch the catch-up wait against a downstream, replacing any prior
    /// wait (which must already have been cancelled).
    async fn spawn_sync_wait(self: &Arc<Self>, downstream: PeerInstance, enable_writes: bool) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        *self.sync_wait.lock().await = Some(SyncWait { stop: stop_tx, done: done_rx });

        let this = self.clone();
        tokio::spawn(async move {
            this.sync_wait_loop(downstream, enable_writes, stop_rx).await;
            let _ = done_tx.send(true);
        });
    }

    /// Cancel any outstanding catch-up wait: signal stop once, then wait
    /// for the loop to acknowledge. Idempotent.
    async fn cancel_sync_wait(&self) {
        let wait = self.sync_wait.lock().await.take();
        if let Some(wait) = wait {
            let _ = wait.stop.send(true);
            let mut done = wait.done;
            let _ = done.wait_for(|done| *done).await;
        }
    }

    async fn sync_wait_loop(
        &self,
        downstream: PeerInstance,
        enable_writes: bool,
        mut stop: watch::Receiver<bool>,
    ) {
        tracing::info!(
            downstream = %downstream.addr,
            "waiting for downstream replication to catch up"
        );

        let mut deadline_base = tokio::time::Instant::now();
        let mut prev_downstream_pos = LogPosition::ZERO;

        loop {
            if *stop.borrow() {
                tracing::debug!("canceled, stopping");
                return;
            }

            let local = match self.daemon.local_position().await {
                Ok(pos) => pos,
                Err(err) => {
                    tracing::error!(error = %err, "error reading local log position");
                    deadline_base = tokio::time::Instant::now();
                    if tick_or_stop(&mut stop).await {
                        return;
                    }
                    continue;
                }
            };

            let remote = match self.daemon.peer_position(&downstream.addr).await {
                Ok(pos) => pos,
                Err(err) => {
                    tracing::error!(error = %err, "error reading downstream log position");
                    deadline_base = tokio::time::Instant::now();
                    if tick_or_stop(&mut stop).await {
                        return;
                    }
                    continue;
                }
            };

            tracing::debug!(local = %local, downstream = %remote, "replication positions");

            // Only an observed equal comparison counts as caught up.
            if local.cmp(&remote) == std::cmp::Ordering::Equal {
                tracing::info!("downstream caught up");
                self.shared.lock().synced_downstream = Some(downstream.clone());
                if enable_writes {
                    if let Err(err) = self.daemon.set_read_write(true).await {
                        tracing::error!(error = %err, "error enabling writes");
                    }
                }
                return;
            }

            // Strict forward progress resets the stall deadline.
            if prev_downstream_pos < remote {
                tracing::debug!("downstream progressing, resetting deadline");
                deadline_base = tokio::time::Instant::now();
            }
            prev_downstream_pos = remote;

            if deadline_base.elapsed() > self.conf.repl_timeout {
                tracing::error!(
                    error = "downstream unable to make forward progress",
                    "error checking replication status"
                );
                return;
            }

            if tick_or_stop(&mut stop).await {
                return;
            }
        }
    }

    async fn write_config(&self) -> Result<(), ProcessError> {
        tokio::fs::create_dir_all(&self.conf.data_dir).await?;
        let rendered = render_daemon_config(&self.conf);
        tokio::fs::write(self.config_path(), rendered).await?;
        Ok(())
    }
}

/// Wait one check interval, returning true if a stop arrived first.
async fn tick_or_stop(stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(CHECK_INTERVAL) => false,
        result = stop.wait_for(|stopped| *stopped) => {
            // A dropped sender counts as cancellation too.
            let _ = result;
            true
        }
    }
}

/// Daemon configuration rendered into the data directory.
fn render_daemon_config(conf: &ProcessConfig) -> String {
    format!(
        r#"storage:
  dbPath: {data_dir}
  journal:
    enabled: true
  engine: wiredTiger

net:
  port: {port}

replication:
  replSetName: rs0
  enableMajorityReadConcern: true
"#,
        data_dir = conf.data_dir.display(),
        port = conf.port,
    )
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
