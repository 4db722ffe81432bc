//! On-disk cache of MCP tool listings.
//!
//! Lets the agent answer "which tools does server X have" without spawning
//! the server. The file is a single JSON document:
//! `{"version": 1, "servers": {"<name>": {"tools": [...], "cachedAt": <epoch ms>}}}`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ensure_parent_dir;

use super::McpTool;

pub const TOOLS_CACHE_VERSION: u32 = 1;

/// Cached listing for one server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CachedServerTools {
    pub tools: Vec<McpTool>,
    #[serde(rename = "cachedAt")]
    pub cached_at: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    servers: HashMap<String, CachedServerTools>,
}

/// Persisted tool listings keyed by server name.
#[derive(Debug, Clone)]
pub struct ToolsCache {
    path: PathBuf,
    servers: HashMap<String, CachedServerTools>,
}

impl ToolsCache {
    /// Empty cache that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            servers: HashMap::new(),
        }
    }

    /// Load from disk. Missing, unreadable or outdated files yield an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let servers = match read_cache_file(&path) {
            Ok(Some(file)) if file.version == TOOLS_CACHE_VERSION => file.servers,
            Ok(Some(file)) => {
                tracing::info!(
                    found = file.version,
                    expected = TOOLS_CACHE_VERSION,
                    "MCP tools cache version mismatch, resetting"
                );
                HashMap::new()
            }
            Ok(None) => HashMap::new(),
            Err(err) => {
                tracing::warn!("Ignoring unreadable MCP tools cache: {err:#}");
                HashMap::new()
            }
        };
        Self { path, servers }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, server: &str) -> Option<&CachedServerTools> {
        self.servers.get(server)
    }

    /// Tools for `server`, if cached.
    pub fn tools(&self, server: &str) -> Option<Vec<McpTool>> {
        self.servers.get(server).map(|entry| entry.tools.clone())
    }

    pub fn update(&mut self, server: &str, tools: Vec<McpTool>) {
        self.servers.insert(
            server.to_string(),
            CachedServerTools {
                tools,
                cached_at: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    pub fn remove(&mut self, server: &str) -> bool {
        self.servers.remove(server).is_some()
    }

    pub fn clear(&mut self) {
        self.servers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Write the cache to disk, creating the parent directory.
    pub fn save(&self) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let file = CacheFile {
            version: TOOLS_CACHE_VERSION,
            servers: self.servers.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write MCP tools cache {}", self.path.display()))
    }

    /// Save, logging instead of failing.
    pub fn save_or_log(&self) {
        if let Err(err) = self.save() {
            tracing::warn!("Failed to persist MCP tools cache: {err:#}");
        }
    }
}

fn read_cache_file(path: &Path) -> Result<Option<CacheFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(file))
}

/// Default location: `~/.desk-agent/mcp-tools-cache.json`.
pub fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".desk-agent")
        .join("mcp-tools-cache.json")
}
