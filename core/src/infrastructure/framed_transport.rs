// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Newline-delimited JSON-RPC framing over a child's piped stdio (spec §4.4,
//! C4).
//!
//! No teacher analogue exists for stdio framing (the teacher talks to tool
//! servers over in-process calls and its SMCP envelopes are not frame-based);
//! this module is grounded instead on the `other_examples` pack's
//! `MatejGomboc-git-proxy-mcp::mcp` stdio transport shape, rewritten around
//! `tokio::io` primitives and explicit close/error callbacks to fit this
//! spec's pool/supervisor ownership model (spec §9 design note: the pool
//! observes the transport only through callbacks, never owns the process
//! handle).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};

use crate::domain::errors::{ProtocolError, TransportError};

/// One inbound event surfaced by the reader task.
#[derive(Debug)]
pub enum InboundEvent {
    Message(Value),
    Error(ProtocolError),
    Closed,
}

/// A framed duplex channel bound to one child's stdio. Invariant: once
/// `closed` is set, no further inbound frames are emitted and any in-flight
/// send fails (spec §4.4 Transport Session invariant).
pub struct FramedTransport {
    server_id: String,
    stdin: Mutex<ChildStdin>,
    closed: Arc<AtomicBool>,
}

impl FramedTransport {
    /// Attaches to a child's stdio, spawning the reader task. Returns the
    /// transport handle plus the channel of inbound events; the caller owns
    /// driving that channel (typically the client pool, see
    /// `application::client_pool`).
    pub fn attach(
        server_id: String,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader_closed = closed.clone();
        let reader_server_id = server_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                if tx.send(InboundEvent::Message(value)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                let preview: String = line.chars().take(200).collect();
                                let _ = tx.send(InboundEvent::Error(ProtocolError {
                                    server_id: reader_server_id.clone(),
                                    preview,
                                }));
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            let _ = tx.send(InboundEvent::Closed);
        });

        (
            Self {
                server_id,
                stdin: Mutex::new(stdin),
                closed,
            },
            rx,
        )
    }

    /// Serializes `value` as one frame and writes it, awaiting flush before
    /// returning (back-pressure is honored by `write_all`/`flush` awaiting
    /// the OS pipe buffer to drain).
    pub async fn send(&self, value: &Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                server_id: self.server_id.clone(),
            });
        }
        let mut line = serde_json::to_vec(value).map_err(|e| TransportError::Io {
            server_id: self.server_id.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|source| TransportError::Io {
                server_id: self.server_id.clone(),
                source,
            })?;
        stdin.flush().await.map_err(|source| TransportError::Io {
            server_id: self.server_id.clone(),
            source,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: marking an already-closed transport closed again is a
    /// no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_after_close() {
        let mut child = tokio::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cat");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let (transport, _rx) = FramedTransport::attach("server-a".to_string(), stdin, stdout);

        transport.send(&serde_json::json!({"ping": true})).await.unwrap();
        transport.close();
        assert!(transport.is_closed());
        let result = transport.send(&serde_json::json!({"ping": true})).await;
        assert!(matches!(result, Err(TransportError::Closed { .. })));

        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn malformed_frame_escalates_and_closes_reader() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo 'not json'; sleep 5")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .expect("spawn sh");
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let (_transport, mut rx) = FramedTransport::attach("server-a".to_string(), stdin, stdout);

        let event = rx.recv().await.expect("event");
        assert!(matches!(event, InboundEvent::Error(_)));

        let _ = child.kill().await;
    }
}
