//! Configuration loading and defaults for desk-agent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::profile::{AgentProfile, DEFAULT_PROFILE_ID};

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay).max(0.0);
        std::time::Duration::from_secs_f64(delay)
    }

    /// Attempts allowed after the first one.
    #[must_use]
    pub fn retry_budget(&self) -> u32 {
        if self.enabled { self.max_retries } else { 0 }
    }
}

/// Resolved configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub mcp_config_path: Option<String>,
    pub tools_cache_path: Option<String>,
    /// Profile used when the CLI is not told otherwise.
    pub default_profile: Option<String>,
    pub retry: Option<RetryConfig>,
    /// Agent profiles keyed by id (`[profiles.<id>]`).
    #[serde(default)]
    pub profiles: HashMap<String, AgentProfile>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str::<Config>(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.normalize_profiles();
        config.validate()?;
        Ok(config)
    }

    /// Validate that critical config fields are present.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        for (id, profile) in &self.profiles {
            if profile.max_iterations == 0 {
                anyhow::bail!("Profile '{id}': max_iterations must be at least 1");
            }
        }
        Ok(())
    }

    /// Profile ids come from the table keys; names default to the id.
    fn normalize_profiles(&mut self) {
        for (id, profile) in &mut self.profiles {
            profile.id.clone_from(id);
            if profile.name.is_empty() || profile.name == "Default" {
                profile.name.clone_from(id);
            }
        }
    }

    /// Resolve a profile by id, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<AgentProfile> {
        let requested = name.or(self.default_profile.as_deref());
        let Some(profile_name) = requested else {
            return Ok(self
                .profiles
                .get(DEFAULT_PROFILE_ID)
                .cloned()
                .unwrap_or_default());
        };
        if let Some(profile) = self.profiles.get(profile_name) {
            return Ok(profile.clone());
        }
        if profile_name == DEFAULT_PROFILE_ID {
            return Ok(AgentProfile::default());
        }
        let mut keys = self.profiles.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        let available = if keys.is_empty() {
            "none".to_string()
        } else {
            keys.join(", ")
        };
        anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
    }

    /// Return the Anthropic-compatible base URL (normalized).
    #[must_use]
    pub fn anthropic_base_url(&self) -> String {
        normalize_base_url(
            self.base_url
                .as_deref()
                .unwrap_or("https://api.anthropic.com"),
        )
    }

    pub fn anthropic_api_key(&self) -> Result<String> {
        self.api_key.clone().context(
            "Failed to load API key: DESK_AGENT_API_KEY missing. Set it in config.toml or environment.",
        )
    }

    /// Resolve the MCP config path.
    #[must_use]
    pub fn mcp_config_path(&self) -> PathBuf {
        self.mcp_config_path
            .as_deref()
            .map(expand_path)
            .or_else(|| home_file("mcp.json"))
            .unwrap_or_else(|| PathBuf::from("./mcp.json"))
    }

    /// Resolve the persisted MCP tools cache path.
    #[must_use]
    pub fn tools_cache_path(&self) -> PathBuf {
        self.tools_cache_path
            .as_deref()
            .map(expand_path)
            .or_else(|| home_file("mcp-tools-cache.json"))
            .unwrap_or_else(|| PathBuf::from("./mcp-tools-cache.json"))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();

        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("DESK_AGENT_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    home_file("config.toml")
}

fn home_file(name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".desk-agent").join(name))
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("DESK_AGENT_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = std::env::var("DESK_AGENT_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Ok(value) = std::env::var("DESK_AGENT_MCP_CONFIG") {
        config.mcp_config_path = Some(value);
    }
    if let Ok(value) = std::env::var("DESK_AGENT_TOOLS_CACHE") {
        config.tools_cache_path = Some(value);
    }
}

fn normalize_base_url(base: &str) -> String {
    base.trim_end_matches('/').trim_end_matches("/v1").to_string()
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
