// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! File I/O for the server config (§6.1) and realtime instructions file
//! (§6.2). Parsing/validation of the JSON shape lives in
//! `application::config_loader`; this module is the thin disk boundary,
//! kept separate the way the teacher's `node_config::NodeConfigManifest`
//! separates `load_or_default` (I/O) from `validate` (pure).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::domain::errors::ConfigError;

/// Raw bytes of the config file at `path`, or `None` if the file does not
/// exist (spec §4.1: missing file ⇒ empty fleet with a warning, not an
/// error).
pub fn read_config_bytes(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn default_config_path(cwd: &Path) -> PathBuf {
    cwd.join("config").join("mcp-servers.json")
}

pub fn default_instructions_path(cwd: &Path) -> PathBuf {
    cwd.join("config").join("instructions.md")
}

/// Cached-by-mtime instructions file reader. Returns the trimmed contents;
/// an empty file is an error per spec §6.2.
pub struct InstructionsFile {
    path: PathBuf,
    cached: Option<(SystemTime, String)>,
}

impl InstructionsFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: None,
        }
    }

    pub fn read(&mut self) -> Result<String, ConfigError> {
        let metadata = std::fs::metadata(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mtime = metadata.modified().map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        if let Some((cached_mtime, contents)) = &self.cached {
            if *cached_mtime == mtime {
                return Ok(contents.clone());
            }
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() {
            return Err(ConfigError::Invalid {
                path: self.path.clone(),
                reason: "instructions file is empty".to_string(),
            });
        }
        self.cached = Some((mtime, trimmed.clone()));
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_none() {
        let path = PathBuf::from("/nonexistent/path/mcp-servers.json");
        assert!(read_config_bytes(&path).unwrap().is_none());
    }

    #[test]
    fn instructions_file_rejects_empty_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instructions.md");
        std::fs::write(&path, "   \n").unwrap();
        let mut file = InstructionsFile::new(path);
        assert!(file.read().is_err());
    }

    #[test]
    fn instructions_file_trims_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instructions.md");
        std::fs::write(&path, "  hello world  \n").unwrap();
        let mut file = InstructionsFile::new(path);
        assert_eq!(file.read().unwrap(), "hello world");
        assert_eq!(file.read().unwrap(), "hello world");
    }
}
