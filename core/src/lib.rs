// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # mcp-fleet-core
//!
//! Runtime heart of the MCP fleet daemon backing a realtime voice assistant:
//! process supervision of child MCP servers, a JSON-RPC client pool over
//! stdio, tool catalog aggregation, invocation dispatch, a revocable tool
//! policy, and a resource-change tracker, fronted by an HTTP boundary.
//!
//! ## Layer structure
//!
//! ```text
//! presentation/   ← axum HTTP API: catalog, invoke, admin, resource events (SSE)
//!     ↓
//! application/    ← process registry/supervisor, client pool, policy/catalog/
//!                   invocation services, resource tracker
//!     ↓
//! domain/         ← server/catalog/policy/invocation/resource entities, events
//!     ↓
//! infrastructure/ ← stdio framing, JSON-RPC wire types, event bus, config file,
//!                   telemetry
//! ```

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
