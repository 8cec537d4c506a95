// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend state persistence across host restarts.
//!
//! The backend marshals one opaque blob per job; on restart the host hands
//! the blobs back together with the log tails captured at shutdown, and the
//! backend reattaches to still-running domains or cleans up after ones that
//! died while it was away.

use super::container::Container;
use super::ContainerBackend;
use crate::error::BackendError;
use gantry_core::{ActiveJob, LogBuffers};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Serialized form of a [`Container`].
#[derive(Debug, Serialize, Deserialize)]
struct PersistedContainer {
    root_path: PathBuf,
    uuid: String,
    pid: Option<i32>,
    ip: Option<Ipv4Addr>,
}

impl ContainerBackend {
    /// Serialize the backend state of one job. Jobs without a live container
    /// have nothing to persist.
    pub fn marshal_job_state(&self, job_id: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let containers = self.containers.read();
        let Some(container) = containers.get(job_id) else {
            return Ok(None);
        };
        let persisted = PersistedContainer {
            root_path: container.root_path.clone(),
            uuid: container.uuid.clone(),
            pid: container.pid,
            ip: container.ip,
        };
        Ok(Some(serde_json::to_vec(&persisted).map_err(BackendError::BadPersistedState)?))
    }

    /// Rebuild in-memory containers from per-job blobs.
    ///
    /// Every reconstructed container gets a watcher that attempts to
    /// reconnect to the existing init socket; jobs whose init is gone are
    /// cleaned up instead of re-registered. This talks to containers, so it
    /// can take a significant moment; it is not just deserialization.
    pub async fn unmarshal_state(
        self: &Arc<Self>,
        jobs: &HashMap<String, ActiveJob>,
        blobs: &HashMap<String, Vec<u8>>,
        mut buffers: LogBuffers,
    ) -> Result<(), BackendError> {
        let mut ready_signals = Vec::new();

        for (id, blob) in blobs {
            let Some(active) = jobs.get(id) else {
                continue;
            };
            let persisted: PersistedContainer =
                serde_json::from_slice(blob).map_err(BackendError::BadPersistedState)?;
            let container = Arc::new(Container::new(
                active.job.clone(),
                persisted.root_path,
                persisted.uuid,
                persisted.pid,
                persisted.ip,
            ));

            let (ready_tx, ready_rx) = oneshot::channel();
            let backend = self.clone();
            let buffer = buffers.remove(id).unwrap_or_default();
            let watched = container.clone();
            tokio::spawn(async move {
                watched.watch(backend, Some(ready_tx), buffer).await;
            });
            ready_signals.push((id.clone(), container, ready_rx));
        }

        // Gather connection attempts; failures clean themselves up through
        // their watcher, which already owns the teardown path.
        for (id, _container, ready_rx) in ready_signals {
            match ready_rx.await {
                Ok(Ok(())) => {
                    tracing::info!(job.id = %id, "reattached to container");
                }
                Ok(Err(err)) => {
                    tracing::error!(job.id = %id, error = %err, "failed to reattach to container");
                }
                Err(_) => {
                    tracing::error!(job.id = %id, "watcher died before reporting readiness");
                }
            }
        }
        Ok(())
    }

    /// Start log followers for every registered container, seeding them from
    /// the tails captured by [`close_logs`] before the restart.
    ///
    /// [`close_logs`]: ContainerBackend::close_logs
    pub async fn open_logs(&self, mut buffers: LogBuffers) -> Result<(), BackendError> {
        let containers: Vec<Arc<Container>> =
            self.containers.read().values().cloned().collect();
        for container in containers {
            if container.job.config.disable_log || container.job.config.tty {
                continue;
            }
            let buffer = buffers.remove(&container.job.id).unwrap_or_default();
            self.follow_logs(&container, buffer).await?;
        }
        Ok(())
    }

    /// Close every log follower and collect the tail of each stream.
    pub fn close_logs(&self) -> LogBuffers {
        let mut streams = self.log_streams.lock();
        let mut buffers = LogBuffers::new();
        for (id, handles) in streams.drain() {
            tracing::info!(job.id = %id, "closing log streams");
            let mut buffer = gantry_core::LogBuffer::new();
            for (stream_id, handle) in handles {
                buffer.insert(stream_id, handle.close());
            }
            buffers.insert(id, buffer);
        }
        buffers
    }
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
