// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool Descriptor and Catalog Payload (spec §3, C7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool advertised by a running server, qualified by server id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// `"<server-id>:<tool-name>"`, unique within a catalog.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub permissions: Vec<String>,
    pub transport: String,
    pub server_id: String,
}

impl ToolDescriptor {
    pub fn qualify(server_id: &str, tool_name: &str) -> String {
        format!("{server_id}:{tool_name}")
    }

    /// Splits a qualified id into `(server_id, tool_name)`. The server id is
    /// everything before the first `:`, per spec's glossary definition.
    pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
        qualified.split_once(':')
    }
}

/// Immutable snapshot of the aggregated, policy-filtered tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPayload {
    pub tools: Vec<ToolDescriptor>,
    pub collected_at: DateTime<Utc>,
}

impl CatalogPayload {
    pub fn find(&self, qualified_id: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.id == qualified_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_and_split_round_trip() {
        let qualified = ToolDescriptor::qualify("server-a", "Summarize");
        assert_eq!(qualified, "server-a:Summarize");
        assert_eq!(
            ToolDescriptor::split_qualified(&qualified),
            Some(("server-a", "Summarize"))
        );
    }

    #[test]
    fn split_qualified_rejects_missing_colon() {
        assert_eq!(ToolDescriptor::split_qualified("no-colon"), None);
    }
}
