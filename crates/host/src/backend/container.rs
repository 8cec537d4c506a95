// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job container record and the watcher that supervises it.

use super::{mounts, ContainerBackend, STOP_TIMEOUT};
use crate::error::BackendError;
use crate::init::{InitClient, InitError, InitState, SOCKET_NAME};
use gantry_core::{Job, JobStatus, LogBuffer};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// How long the watcher retries connecting to the init socket.
const INIT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// How long to wait for an exited domain to leave its supervisor.
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_WAIT_DELAY: Duration = Duration::from_millis(100);

/// Backend-private record of one running container.
///
/// Created by `run` (or state restoration), owned by its watcher task, and
/// destroyed when the watcher exits. `done` closes only after cleanup has
/// completed, so waiters observe a fully released container.
pub(crate) struct Container {
    pub job: Job,
    pub root_path: PathBuf,
    /// Domain UUID assigned by the control plane.
    pub uuid: String,
    /// PID of the domain's supervisor process.
    pub pid: Option<i32>,
    pub ip: Option<Ipv4Addr>,

    client: Mutex<Option<Arc<dyn InitClient>>>,
    done_tx: watch::Sender<bool>,
}

impl Container {
    pub fn new(
        job: Job,
        root_path: PathBuf,
        uuid: String,
        pid: Option<i32>,
        ip: Option<Ipv4Addr>,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self { job, root_path, uuid, pid, ip, client: Mutex::new(None), done_tx }
    }

    /// Record for a job that failed before its domain existed; carries just
    /// enough for `cleanup` to release what was acquired.
    pub fn partial(job: Job, ip: Option<Ipv4Addr>) -> Self {
        Self::new(job, PathBuf::new(), String::new(), None, ip)
    }

    pub fn client(&self) -> Option<Arc<dyn InitClient>> {
        self.client.lock().clone()
    }

    /// Wait until the watcher has finished cleanup.
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Supervise the container: connect to its init, relay state changes to
    /// the registry, and tear everything down when it exits.
    ///
    /// `ready` reports the init connection outcome to state restoration.
    /// `buffer` seeds the log follower with tails captured before a restart.
    pub async fn watch(
        self: Arc<Self>,
        backend: Arc<ContainerBackend>,
        ready: Option<oneshot::Sender<Result<(), BackendError>>>,
        buffer: LogBuffer,
    ) {
        let id = self.job.id.clone();
        tracing::info!(job.id = %id, "start watching container");

        let connected = self.connect_init(&backend).await;
        if let Some(ready) = ready {
            let _ = ready.send(match &connected {
                Ok(_) => Ok(()),
                Err(_) => Err(BackendError::InitConnect),
            });
        }
        let client = match connected {
            Ok(client) => {
                *self.client.lock() = Some(client.clone());
                client
            }
            Err(err) => {
                tracing::error!(job.id = %id, error = %err, "error connecting to container");
                backend.state.set_status_failed(&id, "failed to connect to container");
                if let Err(err) = backend.deps.virt.destroy(&self.uuid).await {
                    tracing::error!(job.id = %id, error = %err, "error destroying domain");
                }
                self.finish(&backend).await;
                return;
            }
        };

        backend.containers.write().insert(id.clone(), self.clone());

        // The supervisor process inherited our bind mounts when the domain
        // was created; drop them from both namespaces.
        {
            let container = self.clone();
            let backend = backend.clone();
            tokio::spawn(async move {
                tracing::info!(job.id = %container.job.id, "cleaning up mounts");
                if let Some(pid) = container.pid {
                    let roots =
                        [backend.conf.image_dir.as_path(), backend.conf.state_dir.as_path()];
                    if let Err(err) = mounts::cleanup_supervisor_mounts(
                        &backend.conf.umount_helper,
                        pid,
                        &roots,
                    )
                    .await
                    {
                        tracing::error!(job.id = %container.job.id, error = %err, "error cleaning up mounts");
                    }
                }
                container.unbind_mounts(&backend);
            });
        }

        if !self.job.config.disable_log && !self.job.config.tty {
            if let Err(err) = backend.follow_logs(&self, buffer).await {
                tracing::error!(job.id = %id, error = %err, "error following logs");
                self.finish(&backend).await;
                return;
            }
        }

        tracing::info!(job.id = %id, "watching for changes");
        let mut terminal_seen = false;
        match client.stream_state().await {
            Ok(mut states) => {
                while let Some(state) = states.recv().await {
                    tracing::info!(job.id = %id, state = ?state, "state change");
                    match state {
                        InitState::Initial => {
                            tracing::info!(job.id = %id, "waiting for attach");
                            backend.state.wait_attach(&id).await;
                            if let Err(err) = client.resume().await {
                                tracing::error!(job.id = %id, error = %err, "error resuming init");
                            }
                        }
                        InitState::Running => {
                            backend.state.set_status_running(&id);
                            let force_stop = backend
                                .state
                                .get_job(&id)
                                .map(|j| j.force_stop)
                                .unwrap_or(false);
                            if force_stop {
                                if let Err(err) = self.stop(&backend).await {
                                    tracing::error!(job.id = %id, error = %err, "error stopping job");
                                }
                            }
                        }
                        InitState::Exited { status } => {
                            tracing::info!(job.id = %id, status, "container exited");
                            let _ = client.resume().await;
                            backend.state.set_status_done(&id, status);
                            terminal_seen = true;
                            break;
                        }
                        InitState::Failed { error } => {
                            tracing::info!(job.id = %id, "container failed to start");
                            let _ = client.resume().await;
                            backend.state.set_status_failed(
                                &id,
                                error.unwrap_or_else(|| "container failed to start".to_string()),
                            );
                            terminal_seen = true;
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!(job.id = %id, error = %err, "error streaming state");
            }
        }

        if !terminal_seen {
            tracing::error!(job.id = %id, "init stream ended unexpectedly");
            backend.state.set_status_failed(&id, "unknown failure");
        }

        client.close().await;
        self.finish(&backend).await;
    }

    /// Connect to the init socket through a short symlink: the socket path
    /// inside the checkout exceeds UNIX_PATH_MAX.
    async fn connect_init(
        &self,
        backend: &Arc<ContainerBackend>,
    ) -> Result<Arc<dyn InitClient>, InitError> {
        let socket = self.root_path.join(SOCKET_NAME);
        let symlink = std::env::temp_dir().join(format!("gantry-init-{}.sock", self.job.id));
        if let Err(err) = std::os::unix::fs::symlink(&socket, &symlink) {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(err.into());
            }
        }
        let _guard = RemoveOnDrop(symlink.clone());

        let start = tokio::time::Instant::now();
        loop {
            match backend.deps.init.connect(&symlink).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    if start.elapsed() >= INIT_CONNECT_TIMEOUT {
                        return Err(err);
                    }
                    tokio::time::sleep(INIT_CONNECT_DELAY).await;
                }
            }
        }
    }

    /// Final teardown: wait for the domain to wind down, force-destroy it so
    /// nothing leaks, deregister, release resources, close `done`.
    async fn finish(&self, backend: &Arc<ContainerBackend>) {
        self.wait_exit(backend).await;
        if !self.uuid.is_empty() {
            match backend.deps.virt.destroy(&self.uuid).await {
                Ok(()) => {}
                Err(err) if matches!(err, crate::virt::VirtError::UnknownDomain(_)) => {}
                Err(err) => {
                    tracing::error!(job.id = %self.job.id, error = %err, "error destroying domain");
                }
            }
        }
        backend.containers.write().remove(&self.job.id);
        self.cleanup(backend).await;
        self.done_tx.send_replace(true);
    }

    /// Poll until the domain has left its running/shutdown states, bounded
    /// by [`EXIT_WAIT_TIMEOUT`].
    async fn wait_exit(&self, backend: &Arc<ContainerBackend>) {
        if self.uuid.is_empty() {
            return;
        }
        tracing::info!(job.id = %self.job.id, "waiting for domain to exit");
        let deadline = tokio::time::Instant::now() + EXIT_WAIT_TIMEOUT;
        loop {
            match backend.deps.virt.state(&self.uuid).await {
                Ok(state) if !state.is_active() => return,
                Err(err) => {
                    tracing::error!(job.id = %self.job.id, error = %err, "error getting domain state");
                    return;
                }
                Ok(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!(job.id = %self.job.id, "reached max wait for domain exit");
                return;
            }
            tokio::time::sleep(EXIT_WAIT_DELAY).await;
        }
    }

    /// Release everything the container acquired. Safe to call on partially
    /// started containers; individual failures are logged and skipped.
    pub(crate) async fn cleanup(&self, backend: &Arc<ContainerBackend>) {
        let id = &self.job.id;
        tracing::info!(job.id = %id, "starting cleanup");

        let streams = backend.log_streams.lock().remove(id);
        if let Some(streams) = streams {
            for (_, stream) in streams {
                stream.close();
            }
        }

        self.unbind_mounts(backend);
        if let Err(err) = backend.deps.images.cleanup(id).await {
            tracing::error!(job.id = %id, error = %err, "error cleaning up image checkout");
        }
        if let Some(ip) = self.ip {
            backend.release_ip(ip);
        }
        tracing::info!(job.id = %id, "finished cleanup");
    }

    /// Unbind the host-namespace binds; they were copied into the domain at
    /// creation so removal here is safe. Errors are logged and ignored (the
    /// hygiene task may already have removed them).
    fn unbind_mounts(&self, backend: &Arc<ContainerBackend>) {
        if self.root_path.as_os_str().is_empty() {
            return;
        }
        let mut targets = vec![
            self.root_path.join(".containerinit"),
            self.root_path.join("etc/resolv.conf"),
        ];
        for mount in &self.job.config.mounts {
            targets.push(self.root_path.join(mount.location.trim_start_matches('/')));
        }
        for volume in &self.job.config.volumes {
            targets.push(self.root_path.join(volume.target.trim_start_matches('/')));
        }
        for target in targets {
            if let Err(err) = backend.deps.mounter.unmount(&target) {
                tracing::debug!(job.id = %self.job.id, path = %target.display(), error = %err, "error unmounting");
            }
        }
    }

    /// SIGTERM the payload; escalate to SIGKILL when it ignores us.
    pub(crate) async fn stop(&self, backend: &Arc<ContainerBackend>) -> Result<(), BackendError> {
        use nix::sys::signal::Signal;

        self.signal_payload(Signal::SIGTERM as i32).await?;
        if self.wait_stop(backend, STOP_TIMEOUT).await.is_err() {
            self.signal_payload(Signal::SIGKILL as i32).await?;
        }
        Ok(())
    }

    async fn signal_payload(&self, signal: i32) -> Result<(), BackendError> {
        let Some(client) = self.client() else {
            return Err(BackendError::JobNotRunning);
        };
        match client.signal(signal).await {
            Ok(()) => Ok(()),
            // A disconnected init means the container died under us, which
            // is what a stop wants anyway.
            Err(InitError::Disconnected) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_stop(
        &self,
        backend: &Arc<ContainerBackend>,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        if let Some(job) = backend.state.get_job(&self.job.id) {
            if matches!(job.status, JobStatus::Done | JobStatus::Crashed | JobStatus::Failed) {
                return Ok(());
            }
        }
        tokio::time::timeout(timeout, self.wait_done())
            .await
            .map_err(|_| BackendError::StopTimeout(timeout))
    }
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl ContainerBackend {
    /// Register log followers for the container's three init streams,
    /// seeding each with any tail captured by a previous follower.
    pub(crate) async fn follow_logs(
        &self,
        container: &Arc<Container>,
        mut buffer: LogBuffer,
    ) -> Result<(), BackendError> {
        use gantry_core::LogStreamId;

        let id = &container.job.id;
        if self.log_streams.lock().contains_key(id) {
            return Ok(());
        }

        let client = container.client().ok_or(BackendError::JobNotRunning)?;
        let streams = client.get_streams().await?;

        let meta = |_stream: LogStreamId| crate::adapters::LogMuxMeta {
            app_id: container
                .job
                .metadata
                .get("gantry-controller.app")
                .cloned()
                .unwrap_or_default(),
            host_id: self.state.host_id().to_string(),
            job_type: container
                .job
                .metadata
                .get("gantry-controller.type")
                .cloned()
                .unwrap_or_default(),
            job_id: id.clone(),
        };

        let mut handles = std::collections::HashMap::new();
        handles.insert(
            LogStreamId::Stdout,
            self.deps.mux.follow(
                streams.stdout,
                buffer.remove(&LogStreamId::Stdout).unwrap_or_default(),
                LogStreamId::Stdout,
                meta(LogStreamId::Stdout),
            ),
        );
        handles.insert(
            LogStreamId::Stderr,
            self.deps.mux.follow(
                streams.stderr,
                buffer.remove(&LogStreamId::Stderr).unwrap_or_default(),
                LogStreamId::Stderr,
                meta(LogStreamId::Stderr),
            ),
        );
        handles.insert(
            LogStreamId::InitLog,
            self.deps.mux.follow(
                streams.init_log,
                buffer.remove(&LogStreamId::InitLog).unwrap_or_default(),
                LogStreamId::InitLog,
                meta(LogStreamId::InitLog),
            ),
        );
        self.log_streams.lock().insert(id.clone(), handles);
        Ok(())
    }
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
