// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! MCP fleet daemon — exposes the wiring and shutdown signal as testable
//! components, with `main.rs` kept to argument parsing and process entry.

pub mod wiring;
