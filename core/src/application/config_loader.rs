// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Config Loader (spec §4.1, §6.1, C1).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::errors::ConfigError;
use crate::domain::server::ServerDefinition;
use crate::infrastructure::config_file::read_config_bytes;

#[derive(Debug, Deserialize)]
struct RawConfig {
    servers: Vec<RawServerEntry>,
}

#[derive(Debug, Deserialize)]
struct RawServerEntry {
    id: serde_json::Value,
    command: serde_json::Value,
    #[serde(default)]
    args: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    enabled: Option<serde_json::Value>,
    #[serde(default, rename = "trackResources")]
    track_resources: Option<serde_json::Value>,
}

/// Loads and validates the server list at `path`. A missing file yields an
/// empty fleet with a `tracing::warn!` (not an error); any structural
/// violation is fatal and reports the file path plus offending index/field.
pub fn load(path: &Path) -> Result<Vec<ServerDefinition>, ConfigError> {
    let contents = match read_config_bytes(path)? {
        Some(c) => c,
        None => {
            tracing::warn!(path = %path.display(), "config file not found, starting with an empty fleet");
            return Ok(Vec::new());
        }
    };

    let raw: RawConfig = serde_json::from_str(&contents).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut definitions = Vec::with_capacity(raw.servers.len());

    for (index, entry) in raw.servers.into_iter().enumerate() {
        let id = entry
            .id
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!("servers[{index}].id must be a non-empty string"),
            })?
            .to_string();

        if !seen_ids.insert(id.clone()) {
            return Err(ConfigError::DuplicateId {
                path: path.to_path_buf(),
                id,
                index,
            });
        }

        let command = entry
            .command
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!("servers[{index}].command must be a non-empty string"),
            })?
            .to_string();

        let args = match entry.args {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(arg_index, v)| {
                    v.as_str().map(str::to_string).ok_or_else(|| ConfigError::Invalid {
                        path: path.to_path_buf(),
                        reason: format!("servers[{index}].args[{arg_index}] must be a string"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("servers[{index}].args must be an array of strings"),
                })
            }
        };

        let enabled = match entry.enabled {
            None => true,
            Some(serde_json::Value::Bool(b)) => b,
            Some(_) => {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("servers[{index}].enabled must be a boolean"),
                })
            }
        };

        let track_resources = match entry.track_resources {
            None => false,
            Some(serde_json::Value::Bool(b)) => b,
            Some(_) => {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("servers[{index}].trackResources must be a boolean"),
                })
            }
        };

        definitions.push(ServerDefinition {
            id,
            command,
            args,
            description: entry.description,
            enabled,
            track_resources,
        });
    }

    Ok(definitions)
}

pub fn default_path(cwd: &Path) -> PathBuf {
    crate::infrastructure::config_file::default_config_path(cwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_fleet() {
        let defs = load(Path::new("/nonexistent/config/mcp-servers.json")).unwrap();
        assert!(defs.is_empty());
    }

    #[test]
    fn parses_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-servers.json");
        std::fs::write(
            &path,
            r#"{"servers":[{"id":"codex","command":"codex-mcp","args":["--stdio"],"trackResources":true}]}"#,
        )
        .unwrap();
        let defs = load(&path).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "codex");
        assert_eq!(defs[0].args, vec!["--stdio".to_string()]);
        assert!(defs[0].enabled);
        assert!(defs[0].track_resources);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-servers.json");
        std::fs::write(
            &path,
            r#"{"servers":[{"id":"a","command":"x"},{"id":"a","command":"y"}]}"#,
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId { .. }));
    }

    #[test]
    fn rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-servers.json");
        std::fs::write(&path, r#"{"servers":[{"id":"a","command":""}]}"#).unwrap();
        assert!(load(&path).is_err());
    }
}
