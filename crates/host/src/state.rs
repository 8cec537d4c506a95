// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory registry of jobs on this host.
//!
//! Serialises status transitions behind one mutex and fans them out to
//! subscribers. Terminal statuses are write-once; later writes are dropped
//! silently so racing watchers cannot resurrect a finished job.

use gantry_core::{ActiveJob, Clock, Job, JobStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

/// Status fan-out payload delivered to registry subscribers.
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub id: String,
    pub job: ActiveJob,
}

/// Thread-safe job registry. All reads return copies.
pub struct HostState {
    /// Stable identifier of this host, stamped into log-mux metadata.
    host_id: String,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    attachers: Mutex<HashMap<String, Arc<Notify>>>,
    events: broadcast::Sender<HostEvent>,
    clock: Arc<dyn Clock>,
}

impl HostState {
    pub fn new(host_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            host_id: host_id.into(),
            jobs: Mutex::new(HashMap::new()),
            attachers: Mutex::new(HashMap::new()),
            events,
            clock,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Register a job in `starting` state.
    pub fn add_job(&self, job: &Job) {
        let id = job.id.clone();
        let active = ActiveJob::new(job.clone(), self.clock.epoch_ms());
        self.jobs.lock().insert(id.clone(), active.clone());
        let _ = self.events.send(HostEvent { id, job: active });
    }

    /// Copy of the registry entry, if any.
    pub fn get_job(&self, id: &str) -> Option<ActiveJob> {
        self.jobs.lock().get(id).cloned()
    }

    /// Copies of every registry entry.
    pub fn jobs(&self) -> HashMap<String, ActiveJob> {
        self.jobs.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn set_container_id(&self, id: &str, container_id: impl Into<String>) {
        self.update(id, |job| job.container_id = Some(container_id.into()));
    }

    pub fn set_container_ip(&self, id: &str, ip: Ipv4Addr) {
        self.update(id, |job| job.internal_ip = Some(ip));
    }

    /// Mark a job so a concurrent `Run` aborts and the watcher stops the
    /// container as soon as it reports running.
    pub fn set_force_stop(&self, id: &str) {
        self.update(id, |job| job.force_stop = true);
    }

    pub fn set_status_running(&self, id: &str) {
        self.transition(id, |job| {
            job.status = JobStatus::Running;
        });
    }

    /// Record container exit. Exit status 0 is `done`, anything else is
    /// `crashed`.
    pub fn set_status_done(&self, id: &str, exit_status: i32) {
        self.transition(id, |job| {
            job.status =
                if exit_status == 0 { JobStatus::Done } else { JobStatus::Crashed };
            job.exit_status = Some(exit_status);
        });
    }

    pub fn set_status_failed(&self, id: &str, error: impl std::fmt::Display) {
        let error = error.to_string();
        self.transition(id, move |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
        });
    }

    /// Register intent to attach to a job before it is run. The watcher will
    /// hold the container in its initial state until [`signal_attach`] fires.
    ///
    /// [`signal_attach`]: HostState::signal_attach
    pub fn register_attacher(&self, id: &str) {
        self.attachers.lock().insert(id.to_string(), Arc::new(Notify::new()));
    }

    /// Release the watcher parked in [`wait_attach`].
    ///
    /// [`wait_attach`]: HostState::wait_attach
    pub fn signal_attach(&self, id: &str) {
        if let Some(notify) = self.attachers.lock().remove(id) {
            notify.notify_one();
        }
    }

    /// Park until a registered attacher arrives. Returns immediately when no
    /// attach intent was registered for the job.
    pub async fn wait_attach(&self, id: &str) {
        let notify = self.attachers.lock().get(id).cloned();
        if let Some(notify) = notify {
            notify.notified().await;
        }
    }

    /// Apply a non-status mutation and broadcast the result.
    fn update(&self, id: &str, f: impl FnOnce(&mut ActiveJob)) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        f(job);
        let event = HostEvent { id: id.to_string(), job: job.clone() };
        drop(jobs);
        let _ = self.events.send(event);
    }

    /// Apply a status transition unless the job is already terminal.
    fn transition(&self, id: &str, f: impl FnOnce(&mut ActiveJob)) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        if job.status.is_terminal() {
            tracing::debug!(job.id = id, status = %job.status, "dropping status write to terminal job");
            return;
        }
        f(job);
        let event = HostEvent { id: id.to_string(), job: job.clone() };
        drop(jobs);
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
