// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the container backend.

use thiserror::Error;

/// Errors surfaced by backend operations.
///
/// Pre-start errors are recoverable to the caller; start-time errors mark the
/// job `failed` on its way out. Container exit is never a backend error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid job partition {0:?}")]
    InvalidPartition(String),

    #[error("unknown port proto {0:?}")]
    UnknownPortProto(String),

    #[error("invalid empty mount target")]
    EmptyMountTarget,

    #[error("job {job_id} requires volume {volume_id}, but that volume does not exist")]
    MissingVolume { job_id: String, volume_id: String },

    #[error("no available IP addresses in {subnet}")]
    NoIpAvailable { subnet: String },

    #[error("error resolving artifact URI: {0}")]
    ArtifactResolve(String),

    #[error("error pulling image: {0}")]
    ImagePull(String),

    #[error("error checking out image: {0}")]
    ImageCheckout(String),

    #[error("error bind mounting {path}: {source}")]
    Mount {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error writing container config: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error("error defining domain: {0}")]
    DomainDefine(String),

    #[error("error creating domain: {0}")]
    DomainCreate(String),

    #[error("failed to connect to container init")]
    InitConnect,

    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("job is not running")]
    JobNotRunning,

    #[error("job doesn't have a TTY")]
    NoTty,

    #[error("stop timed out after {0:?}")]
    StopTimeout(std::time::Duration),

    #[error("failed to deserialize persisted container state: {0}")]
    BadPersistedState(#[source] serde_json::Error),

    #[error(transparent)]
    Init(#[from] crate::init::InitError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from one-shot host network configuration.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid subnet {subnet:?}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("bridge setup failed: {0}")]
    BridgeSetup(String),

    #[error("NAT setup failed: {0}")]
    NatSetup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
