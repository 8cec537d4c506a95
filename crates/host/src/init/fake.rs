// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scriptable fake init client for watcher and attach tests.

use super::{
    InitClient, InitConnector, InitError, InitReader, InitState, InitStreams, InitWriter,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fake init whose state stream is driven by the test.
#[derive(Default)]
pub struct FakeInitClient {
    state_tx: Mutex<Option<mpsc::Sender<InitState>>>,
    /// States emitted before anyone subscribed.
    queued: Mutex<Vec<InitState>>,
    pub resumes: AtomicUsize,
    pub signals: Mutex<Vec<i32>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub closed: AtomicBool,
    /// Bytes served as the payload's stdout by `get_streams`/`get_pty`.
    pub stdout_data: Mutex<Vec<u8>>,
}

impl FakeInitClient {
    /// Emit a state change to the watcher (or queue it until one listens).
    pub async fn send_state(&self, state: InitState) {
        let tx = self.state_tx.lock().clone();
        match tx {
            Some(tx) => {
                let _ = tx.send(state).await;
            }
            None => self.queued.lock().push(state),
        }
    }

    /// Drop the state stream without a terminal state, simulating an init
    /// that died mid-flight.
    pub fn break_state_stream(&self) {
        self.state_tx.lock().take();
    }

    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl InitClient for FakeInitClient {
    async fn resume(&self) -> Result<(), InitError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn signal(&self, signal: i32) -> Result<(), InitError> {
        self.signals.lock().push(signal);
        Ok(())
    }

    async fn resize_pty(&self, height: u16, width: u16) -> Result<(), InitError> {
        self.resizes.lock().push((height, width));
        Ok(())
    }

    async fn get_pty(&self) -> Result<(InitReader, InitWriter), InitError> {
        let data = self.stdout_data.lock().clone();
        Ok((Box::new(std::io::Cursor::new(data)), Box::new(tokio::io::sink())))
    }

    async fn get_stdin(&self) -> Result<InitWriter, InitError> {
        Ok(Box::new(tokio::io::sink()))
    }

    async fn get_streams(&self) -> Result<InitStreams, InitError> {
        let stdout = self.stdout_data.lock().clone();
        Ok(InitStreams {
            stdout: Box::new(std::io::Cursor::new(stdout)),
            stderr: Box::new(tokio::io::empty()),
            init_log: Box::new(tokio::io::empty()),
        })
    }

    async fn stream_state(&self) -> Result<mpsc::Receiver<InitState>, InitError> {
        let (tx, rx) = mpsc::channel(8);
        for state in self.queued.lock().drain(..) {
            let _ = tx.try_send(state);
        }
        *self.state_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector serving scripted clients keyed by job ID. The job ID is read
/// back out of the socket symlink name, exactly as the watcher created it.
/// Unregistered jobs are refused, like an init that never came up.
#[derive(Default)]
pub struct FakeInitConnector {
    clients: Mutex<std::collections::HashMap<String, Arc<FakeInitClient>>>,
    pub refuse: AtomicBool,
    pub connects: AtomicUsize,
}

impl FakeInitConnector {
    /// Script the init of one job; the returned handle drives its states.
    pub fn register(&self, job_id: &str) -> Arc<FakeInitClient> {
        let client = Arc::new(FakeInitClient::default());
        self.clients.lock().insert(job_id.to_string(), client.clone());
        client
    }
}

#[async_trait]
impl InitConnector for FakeInitConnector {
    async fn connect(&self, socket: &Path) -> Result<Arc<dyn InitClient>, InitError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused =
            || InitError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        if self.refuse.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let job_id = socket
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("gantry-init-"))
            .and_then(|name| name.strip_suffix(".sock"))
            .ok_or_else(refused)?;
        let client = self.clients.lock().get(job_id).cloned().ok_or_else(refused)?;
        Ok(client)
    }
}
