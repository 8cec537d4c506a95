// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bidirectional I/O attachment to running (and recently exited) jobs.

use super::container::Container;
use super::ContainerBackend;
use crate::error::BackendError;
use crate::init::{InitReader, InitWriter};
use gantry_core::JobStatus;
use std::sync::Arc;
use tokio::sync::oneshot;

/// How an attach session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachExit {
    /// Streams ended with no terminal status to report (e.g. attaching to
    /// an exited job with logging disabled).
    Eof,
    /// The job reached `done`/`crashed` with this exit status.
    Exit(i32),
    /// The job failed; the captured error follows.
    Error(String),
}

/// A request to wire caller-provided streams to a job.
pub struct AttachRequest {
    pub job_id: String,
    /// Requested pty size, for TTY jobs.
    pub height: u16,
    pub width: u16,
    /// Signalled once the attach is wired up and the job may be resumed.
    pub attached: Option<oneshot::Sender<()>>,
    pub stdin: Option<InitReader>,
    pub stdout: Option<InitWriter>,
    pub stderr: Option<InitWriter>,
    pub init_log: Option<InitWriter>,
    /// Deliver the buffered log tail.
    pub logs: bool,
    /// Follow live output.
    pub stream: bool,
}

impl AttachRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            height: 0,
            width: 0,
            attached: None,
            stdin: None,
            stdout: None,
            stderr: None,
            init_log: None,
            logs: false,
            stream: false,
        }
    }
}

fn sink_or(writer: Option<InitWriter>) -> InitWriter {
    writer.unwrap_or_else(|| Box::new(tokio::io::sink()))
}

fn notify_attached(attached: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = attached.take() {
        let _ = tx.send(());
    }
}

impl ContainerBackend {
    /// Attach to a job.
    ///
    /// TTY jobs get their pty piped; non-TTY jobs either stream the init's
    /// three raw streams (logging disabled) or replay/follow through the log
    /// multiplexer. Attaching to an already-exited job with logging disabled
    /// yields an immediate [`AttachExit::Eof`].
    pub async fn attach(
        self: &Arc<Self>,
        mut req: AttachRequest,
    ) -> Result<AttachExit, BackendError> {
        let job = self.state.get_job(&req.job_id);
        let tty = job.as_ref().map(|j| j.job.config.tty).unwrap_or(false);
        let disable_log = job.as_ref().map(|j| j.job.config.disable_log).unwrap_or(false);

        let container = match self.container(&req.job_id) {
            Some(container) => container,
            None => {
                if tty || req.stdin.is_some() {
                    return Err(BackendError::JobNotRunning);
                }
                if disable_log {
                    notify_attached(&mut req.attached);
                    return Ok(AttachExit::Eof);
                }
                // The container is gone but its logs are still in the mux.
                return self.attach_logs(req, None).await;
            }
        };

        if tty {
            return self.attach_tty(req, &container).await;
        }

        if let Some(stdin) = req.stdin.take() {
            let client = container.client().ok_or(BackendError::JobNotRunning)?;
            let mut payload_stdin = client.get_stdin().await?;
            tokio::spawn(async move {
                let mut stdin = stdin;
                let _ = tokio::io::copy(&mut stdin, &mut payload_stdin).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut payload_stdin).await;
            });
        }

        if disable_log {
            return self.attach_raw_streams(req, &container).await;
        }

        self.attach_logs(req, Some(&container)).await
    }

    /// TTY mode: size the pty, pipe stdin and the master.
    async fn attach_tty(
        self: &Arc<Self>,
        mut req: AttachRequest,
        container: &Arc<Container>,
    ) -> Result<AttachExit, BackendError> {
        let client = container.client().ok_or(BackendError::JobNotRunning)?;
        client.resize_pty(req.height, req.width).await?;
        let (mut pty_out, pty_in) = client.get_pty().await?;
        notify_attached(&mut req.attached);

        match (req.stdin.take(), req.stdout.take()) {
            (Some(mut stdin), Some(mut stdout)) => {
                let mut pty_in = pty_in;
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut stdin, &mut pty_in).await;
                });
                let _ = tokio::io::copy(&mut pty_out, &mut stdout).await;
            }
            (Some(mut stdin), None) => {
                let mut pty_in = pty_in;
                let _ = tokio::io::copy(&mut stdin, &mut pty_in).await;
            }
            (None, Some(mut stdout)) => {
                let _ = tokio::io::copy(&mut pty_out, &mut stdout).await;
            }
            (None, None) => {}
        }

        Ok(self.exit_status(container).await)
    }

    /// Logging-disabled mode: duplex directly on the init's three streams
    /// and finish when they all hit EOF.
    async fn attach_raw_streams(
        self: &Arc<Self>,
        mut req: AttachRequest,
        container: &Arc<Container>,
    ) -> Result<AttachExit, BackendError> {
        let client = container.client().ok_or(BackendError::JobNotRunning)?;
        let streams = client.get_streams().await?;
        notify_attached(&mut req.attached);

        let mut tasks = tokio::task::JoinSet::new();
        let copies: [(InitReader, InitWriter); 3] = [
            (streams.init_log, sink_or(req.init_log.take())),
            (streams.stdout, sink_or(req.stdout.take())),
            (streams.stderr, sink_or(req.stderr.take())),
        ];
        for (mut reader, mut writer) in copies {
            tasks.spawn(async move {
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        if req.stream {
            return Ok(self.exit_status(container).await);
        }
        Ok(AttachExit::Eof)
    }

    /// Multiplexer mode: replay the tail and/or follow live messages,
    /// routing each to the requested sink by stream ID.
    async fn attach_logs(
        self: &Arc<Self>,
        mut req: AttachRequest,
        container: Option<&Arc<Container>>,
    ) -> Result<AttachExit, BackendError> {
        use gantry_core::LogStreamId;
        use tokio::io::AsyncWriteExt;

        notify_attached(&mut req.attached);
        let mut messages = self.deps.mux.subscribe(&req.job_id, req.logs, req.stream)?;

        let mut stdout = req.stdout.take();
        let mut stderr = req.stderr.take();
        let mut init_log = req.init_log.take();

        while let Some(message) = messages.recv().await {
            let writer = match message.stream {
                LogStreamId::Stdout => stdout.as_mut(),
                LogStreamId::Stderr => stderr.as_mut(),
                LogStreamId::InitLog => init_log.as_mut(),
            };
            let Some(writer) = writer else {
                continue;
            };
            let mut data = message.data;
            data.push(b'\n');
            if writer.write_all(&data).await.is_err() {
                return Ok(AttachExit::Eof);
            }
        }

        match container {
            Some(container) if req.stream => Ok(self.exit_status(container).await),
            _ => Ok(AttachExit::Eof),
        }
    }

    /// Wait for the watcher to finish cleanup, then report the job's
    /// terminal outcome.
    async fn exit_status(&self, container: &Arc<Container>) -> AttachExit {
        container.wait_done().await;
        match self.state.get_job(&container.job.id) {
            Some(job) if matches!(job.status, JobStatus::Done | JobStatus::Crashed) => {
                AttachExit::Exit(job.exit_status.unwrap_or(0))
            }
            Some(job) if job.status == JobStatus::Failed => {
                AttachExit::Error(job.error.unwrap_or_else(|| "job failed".to_string()))
            }
            _ => AttachExit::Eof,
        }
    }
}

#[cfg(test)]
#[path = "attach_tests.rs"]
mod tests;
