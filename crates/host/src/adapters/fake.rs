// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory fakes for the backend's collaborators.

use super::{
    DiscoveryClient, ImageConfig, ImageStore, LogMessage, LogMux, LogMuxMeta, LogStreamHandle,
    VolumeManager,
};
use crate::backend::mounts::Mounter;
use async_trait::async_trait;
use gantry_core::LogStreamId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Image store backed by a tempdir; checkouts are real directories.
pub struct FakeImageStore {
    root: tempfile::TempDir,
    pub config: Mutex<ImageConfig>,
    pub pull_fails: AtomicBool,
    /// Remaining checkout attempts that fail with EINVAL before succeeding.
    pub checkout_einval_remaining: AtomicUsize,
    pub pulled: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
}

impl FakeImageStore {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("tempdir"),
            config: Mutex::new(ImageConfig {
                entrypoint: vec!["/bin/payload".to_string()],
                ..ImageConfig::default()
            }),
            pull_fails: AtomicBool::new(false),
            checkout_einval_remaining: AtomicUsize::new(0),
            pulled: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn checkout_path(&self, job_id: &str) -> PathBuf {
        self.root.path().join(job_id)
    }
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn pull(&self, uri: &str) -> io::Result<String> {
        if self.pull_fails.load(Ordering::SeqCst) {
            return Err(io::Error::other("registry unreachable"));
        }
        self.pulled.lock().push(uri.to_string());
        Ok("img-0001".to_string())
    }

    async fn image_config(&self, _image_id: &str) -> io::Result<ImageConfig> {
        Ok(self.config.lock().clone())
    }

    async fn checkout(&self, job_id: &str, _image_id: &str) -> io::Result<PathBuf> {
        if self
            .checkout_einval_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::from_raw_os_error(22));
        }
        let path = self.checkout_path(job_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    async fn cleanup(&self, job_id: &str) -> io::Result<()> {
        self.cleaned.lock().push(job_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeVolumeManager {
    volumes: Mutex<HashMap<String, PathBuf>>,
}

impl FakeVolumeManager {
    pub fn add(&self, volume_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.volumes.lock().insert(volume_id.into(), path.into());
    }
}

impl VolumeManager for FakeVolumeManager {
    fn lookup(&self, volume_id: &str) -> Option<PathBuf> {
        self.volumes.lock().get(volume_id).cloned()
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    services: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeDiscovery {
    pub fn register(&self, service: impl Into<String>, addrs: Vec<String>) {
        self.services.lock().insert(service.into(), addrs);
    }
}

#[async_trait]
impl DiscoveryClient for FakeDiscovery {
    async fn service_addrs(&self, service: &str) -> io::Result<Vec<String>> {
        Ok(self.services.lock().get(service).cloned().unwrap_or_default())
    }
}

/// Multiplexer fake: followed streams drain into shared buffers, attach
/// subscriptions replay messages recorded by the test.
#[derive(Default)]
pub struct FakeLogMux {
    followed: Mutex<HashMap<(String, LogStreamId), Arc<Mutex<Vec<u8>>>>>,
    recorded: Mutex<HashMap<String, Vec<LogMessage>>>,
}

impl FakeLogMux {
    /// Record a message for later delivery through `subscribe`.
    pub fn record(&self, job_id: &str, stream: LogStreamId, data: &[u8]) {
        self.recorded
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .push(LogMessage { stream, data: data.to_vec() });
    }

    /// Bytes collected by the follower of one stream (seed included).
    pub fn followed_bytes(&self, job_id: &str, stream: LogStreamId) -> Vec<u8> {
        self.followed
            .lock()
            .get(&(job_id.to_string(), stream))
            .map(|buf| buf.lock().clone())
            .unwrap_or_default()
    }

    pub fn follow_count(&self) -> usize {
        self.followed.lock().len()
    }
}

struct FakeLogStream {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogStreamHandle for FakeLogStream {
    fn close(self: Box<Self>) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl LogMux for FakeLogMux {
    fn follow(
        &self,
        mut stream: Box<dyn AsyncRead + Send + Unpin>,
        seed: Vec<u8>,
        stream_id: LogStreamId,
        meta: LogMuxMeta,
    ) -> Box<dyn LogStreamHandle> {
        let buf = Arc::new(Mutex::new(seed));
        self.followed.lock().insert((meta.job_id.clone(), stream_id), buf.clone());
        let reader_buf = buf.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            while let Ok(n) = stream.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                reader_buf.lock().extend_from_slice(&chunk[..n]);
            }
        });
        Box::new(FakeLogStream { buf })
    }

    fn subscribe(
        &self,
        job_id: &str,
        tail: bool,
        _follow: bool,
    ) -> io::Result<mpsc::Receiver<LogMessage>> {
        let (tx, rx) = mpsc::channel(64);
        let messages = if tail {
            self.recorded.lock().get(job_id).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        tokio::spawn(async move {
            for message in messages {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Mount accounting without syscalls.
#[derive(Default)]
pub struct FakeMounter {
    active: Mutex<Vec<PathBuf>>,
    pub bound: Mutex<Vec<(PathBuf, PathBuf, bool)>>,
}

impl FakeMounter {
    pub fn active(&self) -> Vec<PathBuf> {
        self.active.lock().clone()
    }
}

impl Mounter for FakeMounter {
    fn bind_mount(&self, src: &Path, dest: &Path, writeable: bool) -> io::Result<()> {
        self.active.lock().push(dest.to_path_buf());
        self.bound.lock().push((src.to_path_buf(), dest.to_path_buf(), writeable));
        Ok(())
    }

    fn unmount(&self, path: &Path) -> io::Result<()> {
        let mut active = self.active.lock();
        match active.iter().position(|p| p == path) {
            Some(i) => {
                active.remove(i);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(22)),
        }
    }
}
