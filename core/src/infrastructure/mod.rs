// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod config_file;
pub mod event_bus;
pub mod framed_transport;
pub mod json_rpc;
pub mod telemetry;
