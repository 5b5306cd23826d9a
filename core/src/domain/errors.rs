// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Error kinds for the fleet runtime.
//!
//! These are kinds, not a single catch-all type: each component surfaces the
//! kind relevant to its own failure modes (see spec §7). `ConfigError` is
//! fatal at startup/reload; `TransportError`/`ProtocolError` are recovered
//! locally by the supervisor/client pool; the rest are surfaced to callers
//! as terminal invocation/catalog/admin outcomes.

use std::path::PathBuf;
use thiserror::Error;

/// Config file is missing required shape or has a bad field.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("config file {path}: duplicate server id {id:?} at index {index}")]
    DuplicateId {
        path: PathBuf,
        id: String,
        index: usize,
    },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A transport session failed; the session is closed and the pool entry evicted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server {server_id}: stream not writable")]
    NotWritable { server_id: String },
    #[error("server {server_id}: transport closed")]
    Closed { server_id: String },
    #[error("server {server_id}: io error: {source}")]
    Io {
        server_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// A frame on the wire could not be parsed as JSON.
#[derive(Debug, Error)]
#[error("server {server_id}: malformed frame, preview: {preview:?}")]
pub struct ProtocolError {
    pub server_id: String,
    pub preview: String,
}

/// A request did not complete before its deadline.
#[derive(Debug, Error)]
#[error("{operation} timed out after {elapsed_ms}ms")]
pub struct TimeoutError {
    pub operation: String,
    pub elapsed_ms: u64,
}

/// The caller lacks a permission required by the tool descriptor.
#[derive(Debug, Error)]
#[error("missing permissions: {}", .missing.join(", "))]
pub struct PermissionError {
    pub missing: Vec<String>,
}

/// Tool input failed schema validation.
#[derive(Debug, Error)]
#[error("input validation failed: {}", .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

/// An id referred to something that does not exist.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("tool not found in catalog: {tool_id}")]
    Tool { tool_id: String },
    #[error("no active invocation: {invocation_id}")]
    Invocation { invocation_id: String },
    #[error("server not available: {server_id}")]
    Server { server_id: String },
}

/// The tool was revoked at dispatch time.
#[derive(Debug, Error)]
#[error("tool revoked: {tool_id}")]
pub struct RevocationError {
    pub tool_id: String,
}

/// A server lacks a capability this component depends on.
#[derive(Debug, Error)]
#[error("server {server_id} does not support {capability}")]
pub struct UnsupportedError {
    pub server_id: String,
    pub capability: String,
}

/// An invalid domain state transition was attempted (e.g. starting a server
/// that is already running). Mirrors the transition-guard pattern used
/// throughout the domain entities below.
#[derive(Debug, Error)]
#[error("invalid state transition from {from} to {to}")]
pub struct InvalidStateTransition {
    pub from: String,
    pub to: String,
}
