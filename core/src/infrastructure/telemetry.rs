// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Metrics emission helpers, matching the teacher's use of the `metrics`
//! facade (recorder installed once in `daemon::main`, call sites elsewhere
//! just call the free functions/macros).

use metrics::{counter, histogram};

pub fn record_catalog_handshake(cache_hit: bool, tool_count: usize) {
    counter!("mcp_fleet_catalog_handshake_total", "cache_hit" => cache_hit.to_string()).increment(1);
    if !cache_hit {
        histogram!("mcp_fleet_catalog_tool_count").record(tool_count as f64);
    }
}

pub fn record_invocation(status: &'static str, duration_ms: u64) {
    counter!("mcp_fleet_invocation_total", "status" => status).increment(1);
    histogram!("mcp_fleet_invocation_duration_ms", "status" => status).record(duration_ms as f64);
}

pub fn record_restart(server_id: &str) {
    counter!("mcp_fleet_restart_total", "server_id" => server_id.to_string()).increment(1);
}

pub fn record_resource_update(server_id: &str) {
    counter!("mcp_fleet_resource_update_total", "server_id" => server_id.to_string()).increment(1);
}
