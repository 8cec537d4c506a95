// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol for the init socket.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. The RPC
//! connection carries one request/response pair at a time; state streaming
//! and raw stdio streams each use a dedicated connection opened with a
//! handshake frame, so no file descriptors ever cross the socket.

use super::{
    InitClient, InitConnector, InitError, InitReader, InitState, InitStreams, InitWriter,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};

/// Upper bound on a single frame. State changes and acks are tiny; anything
/// larger is a corrupt stream.
pub const MAX_FRAME: u32 = 1024 * 1024;

/// Requests the host sends to the init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Resume,
    Signal { signal: i32 },
    ResizePty { height: u16, width: u16 },
    /// Turn this connection into a state-change stream.
    StreamState,
    /// Turn this connection into a raw stdio stream.
    OpenStream { stream: StreamKind },
}

/// Which raw stream a dedicated connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    InitLog,
    Stdin,
    Pty,
}

/// Responses from the init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { message: String },
    State { state: InitState },
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, InitError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| InitError::Protocol(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, InitError> {
    serde_json::from_slice(payload).map_err(|e| InitError::Protocol(e.to_string()))
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, msg: &T) -> Result<(), InitError> {
    let frame = encode(msg)?;
    stream.write_all(&frame).await.map_err(disconnect_on_broken_pipe)?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut UnixStream,
) -> Result<T, InitError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.map_err(disconnect_on_broken_pipe)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(InitError::Protocol(format!("frame too large: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.map_err(disconnect_on_broken_pipe)?;
    decode(&payload)
}

fn disconnect_on_broken_pipe(err: std::io::Error) -> InitError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionAborted => InitError::Disconnected,
        _ => InitError::Io(err),
    }
}

fn expect_ok(response: Response) -> Result<(), InitError> {
    match response {
        Response::Ok => Ok(()),
        Response::Error { message } => Err(InitError::Protocol(message)),
        Response::State { .. } => {
            Err(InitError::Protocol("unexpected state frame".to_string()))
        }
    }
}

/// Production [`InitClient`] speaking the frame protocol over UNIX sockets.
pub struct WireInitClient {
    socket: PathBuf,
    rpc: Mutex<Option<UnixStream>>,
}

impl WireInitClient {
    async fn rpc(&self, request: &Request) -> Result<Response, InitError> {
        let mut guard = self.rpc.lock().await;
        let stream = guard.as_mut().ok_or(InitError::Disconnected)?;
        write_frame(stream, request).await?;
        read_frame(stream).await
    }

    /// Open a dedicated connection and hand it over with a handshake.
    async fn open_raw(&self, request: Request) -> Result<UnixStream, InitError> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        write_frame(&mut stream, &request).await?;
        expect_ok(read_frame(&mut stream).await?)?;
        Ok(stream)
    }
}

#[async_trait]
impl InitClient for WireInitClient {
    async fn resume(&self) -> Result<(), InitError> {
        expect_ok(self.rpc(&Request::Resume).await?)
    }

    async fn signal(&self, signal: i32) -> Result<(), InitError> {
        expect_ok(self.rpc(&Request::Signal { signal }).await?)
    }

    async fn resize_pty(&self, height: u16, width: u16) -> Result<(), InitError> {
        expect_ok(self.rpc(&Request::ResizePty { height, width }).await?)
    }

    async fn get_pty(&self) -> Result<(InitReader, InitWriter), InitError> {
        let stream = self.open_raw(Request::OpenStream { stream: StreamKind::Pty }).await?;
        let (r, w) = stream.into_split();
        Ok((Box::new(r), Box::new(w)))
    }

    async fn get_stdin(&self) -> Result<InitWriter, InitError> {
        let stream =
            self.open_raw(Request::OpenStream { stream: StreamKind::Stdin }).await?;
        let (_, w) = stream.into_split();
        Ok(Box::new(w))
    }

    async fn get_streams(&self) -> Result<InitStreams, InitError> {
        let stdout =
            self.open_raw(Request::OpenStream { stream: StreamKind::Stdout }).await?;
        let stderr =
            self.open_raw(Request::OpenStream { stream: StreamKind::Stderr }).await?;
        let init_log =
            self.open_raw(Request::OpenStream { stream: StreamKind::InitLog }).await?;
        Ok(InitStreams {
            stdout: Box::new(stdout.into_split().0),
            stderr: Box::new(stderr.into_split().0),
            init_log: Box::new(init_log.into_split().0),
        })
    }

    async fn stream_state(&self) -> Result<mpsc::Receiver<InitState>, InitError> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        write_frame(&mut stream, &Request::StreamState).await?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                match read_frame::<Response>(&mut stream).await {
                    Ok(Response::State { state }) => {
                        let terminal = state.is_terminal();
                        if tx.send(state).await.is_err() || terminal {
                            break;
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected frame on state stream");
                        break;
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.rpc.lock().await.take();
    }
}

/// Connector producing [`WireInitClient`]s.
#[derive(Default)]
pub struct WireInitConnector;

#[async_trait]
impl InitConnector for WireInitConnector {
    async fn connect(&self, socket: &Path) -> Result<Arc<dyn InitClient>, InitError> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Arc::new(WireInitClient {
            socket: socket.to_path_buf(),
            rpc: Mutex::new(Some(stream)),
        }))
    }
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
