// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapters for external collaborators.
//!
//! Each trait is a narrow capability the backend depends on: the image layer
//! store, the volume manager, the log multiplexer and the service discovery
//! client. Production implementations live with the embedding host process;
//! tests use the in-crate fakes.

use async_trait::async_trait;
use gantry_core::LogStreamId;
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
pub(crate) use fake::{
    FakeDiscovery, FakeImageStore, FakeLogMux, FakeMounter, FakeVolumeManager,
};

/// Runtime defaults packaged with an image.
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    pub user: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
}

/// Content-addressed image store: pulls artifacts and lays out writable
/// roots from their layers.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Pull the artifact and return its image ID.
    async fn pull(&self, uri: &str) -> io::Result<String>;

    /// Read the packaged config of a pulled image.
    async fn image_config(&self, image_id: &str) -> io::Result<ImageConfig>;

    /// Lay out a writable rootfs for the job from the image's layers.
    async fn checkout(&self, job_id: &str, image_id: &str) -> io::Result<PathBuf>;

    /// Tear down the writable rootfs of a job.
    async fn cleanup(&self, job_id: &str) -> io::Result<()>;
}

/// Volume manager lookup surface.
pub trait VolumeManager: Send + Sync {
    /// Host path backing the volume, or `None` if it does not exist.
    fn lookup(&self, volume_id: &str) -> Option<PathBuf>;
}

/// Service discovery lookup, used to resolve `.discoverd` artifact hosts.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn service_addrs(&self, service: &str) -> io::Result<Vec<String>>;
}

/// Metadata stamped onto every multiplexed log message.
#[derive(Debug, Clone, Default)]
pub struct LogMuxMeta {
    pub app_id: String,
    pub host_id: String,
    pub job_type: String,
    pub job_id: String,
}

/// A followed stream registered with the multiplexer.
pub trait LogStreamHandle: Send {
    /// Stop following, drain, and return the bounded tail of the stream.
    fn close(self: Box<Self>) -> Vec<u8>;
}

/// One demultiplexed log message delivered to an attach subscriber.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub stream: LogStreamId,
    pub data: Vec<u8>,
}

/// Log multiplexer: fans container output into the host log sink and back
/// out to attach subscribers.
pub trait LogMux: Send + Sync {
    /// Follow a raw container stream. `seed` is a tail buffer captured by a
    /// previous follower, replayed so restarts lose no bytes.
    fn follow(
        &self,
        stream: Box<dyn AsyncRead + Send + Unpin>,
        seed: Vec<u8>,
        stream_id: LogStreamId,
        meta: LogMuxMeta,
    ) -> Box<dyn LogStreamHandle>;

    /// Subscribe to a job's messages: the buffered tail when `tail`, then
    /// live messages while `follow`. The subscription ends when the receiver
    /// is dropped.
    fn subscribe(
        &self,
        job_id: &str,
        tail: bool,
        follow: bool,
    ) -> io::Result<mpsc::Receiver<LogMessage>>;
}
