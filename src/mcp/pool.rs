//! Process-wide MCP connector pool.
//!
//! Connectors are keyed by `scope:server`. A slot is reserved with a shared
//! pending future before anything is awaited, so concurrent callers asking
//! for the same key converge on a single connection attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};

use super::McpTool;
use super::cache::ToolsCache;
use super::config::{McpServerConfig, McpTimeouts};
use super::connector::{ConnectorFactory, DefaultConnectorFactory, McpConnector};
use super::scope::{calculate_scope, interpolate, pool_key};

type ConnectorResult = Result<Arc<McpConnector>, Arc<anyhow::Error>>;
type PendingConnector = Shared<BoxFuture<'static, ConnectorResult>>;

struct PoolEntry {
    server: String,
    /// Interpolated config the connector is (being) created from.
    config: McpServerConfig,
    connector: PendingConnector,
}

impl PoolEntry {
    fn failed(&self) -> bool {
        matches!(self.connector.peek(), Some(Err(_)))
    }
}

/// Owns every live MCP connector. Share it with `Arc`.
pub struct McpManager {
    factory: Arc<dyn ConnectorFactory>,
    pool: Mutex<HashMap<String, PoolEntry>>,
    cache: Mutex<ToolsCache>,
}

impl McpManager {
    pub fn new(factory: Arc<dyn ConnectorFactory>, cache: ToolsCache) -> Self {
        Self {
            factory,
            pool: Mutex::new(HashMap::new()),
            cache: Mutex::new(cache),
        }
    }

    /// Manager backed by real transports and the cache file at `cache_path`.
    pub fn with_defaults(timeouts: McpTimeouts, cache_path: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(DefaultConnectorFactory::new(timeouts)),
            ToolsCache::load(cache_path),
        )
    }

    fn pool(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.pool.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, ToolsCache> {
        self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ensure a connector exists for every requested server and return the ready ones.
    ///
    /// `enabled` limits the servers considered (default: every configured one).
    /// Servers that fail to connect are logged and left out of the result.
    pub async fn init_connectors(
        &self,
        configs: &HashMap<String, McpServerConfig>,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
        force_reload: bool,
        enabled: Option<&[String]>,
    ) -> Vec<Arc<McpConnector>> {
        let names: Vec<String> = match enabled {
            Some(names) => names.to_vec(),
            None => {
                let mut names: Vec<String> = configs.keys().cloned().collect();
                names.sort();
                names
            }
        };

        let mut pending: Vec<(String, PendingConnector, bool)> = Vec::new();
        {
            let mut pool = self.pool();
            for name in names {
                let Some(config) = configs.get(&name) else {
                    tracing::warn!(server = %name, "Enabled MCP server has no configuration");
                    continue;
                };
                if config.disabled {
                    tracing::debug!(server = %name, "Skipping disabled MCP server");
                    continue;
                }

                let scope = calculate_scope(config, project_dir, task_dir);
                let key = pool_key(&scope, &name);
                let interpolated = interpolate(config, project_dir, task_dir);

                if !force_reload
                    && let Some(entry) = pool.get(&key)
                    && entry.config == interpolated
                    && !entry.failed()
                {
                    pending.push((name, entry.connector.clone(), false));
                    continue;
                }

                let previous = pool.remove(&key).map(|entry| entry.connector);
                if previous.is_some() {
                    tracing::info!(server = %name, scope = %scope, "Replacing MCP connector");
                }
                let connector =
                    self.start_creation(&name, interpolated.clone(), project_dir, task_dir, previous);
                pool.insert(
                    key,
                    PoolEntry {
                        server: name.clone(),
                        config: interpolated,
                        connector: connector.clone(),
                    },
                );
                pending.push((name, connector, true));
            }
        }

        let results = join_all(pending.iter().map(|(_, fut, _)| fut.clone())).await;

        let mut ready = Vec::with_capacity(results.len());
        let mut cache_dirty = false;
        for ((name, _, created), result) in pending.into_iter().zip(results) {
            match result {
                Ok(connector) => {
                    if created {
                        self.cache().update(&name, connector.tools().to_vec());
                        cache_dirty = true;
                    }
                    ready.push(connector);
                }
                Err(err) => {
                    tracing::error!(server = %name, "Failed to initialize MCP server: {err:#}");
                }
            }
        }

        if cache_dirty {
            self.cache().save_or_log();
        }
        self.pool().retain(|_, entry| !entry.failed());

        ready
    }

    /// Spawn the creation task. A replaced connector is closed once the new one settles.
    fn start_creation(
        &self,
        name: &str,
        config: McpServerConfig,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
        previous: Option<PendingConnector>,
    ) -> PendingConnector {
        let factory = Arc::clone(&self.factory);
        let name = name.to_string();
        let project_dir = project_dir.map(String::from);
        let task_dir = task_dir.map(String::from);

        let handle = tokio::spawn(async move {
            let result = factory
                .create(&name, &config, project_dir.as_deref(), task_dir.as_deref())
                .await
                .map(Arc::new)
                .map_err(Arc::new);

            if let Some(previous) = previous
                && let Ok(old) = previous.await
                && let Err(err) = old.close().await
            {
                tracing::warn!(server = %name, "Failed to close replaced MCP connector: {err}");
            }
            result
        });

        async move {
            handle
                .await
                .map_err(|err| Arc::new(anyhow!("MCP connector task failed: {err}")))?
        }
        .boxed()
        .shared()
    }

    /// Every connector that has finished connecting successfully.
    pub fn connectors(&self) -> Vec<Arc<McpConnector>> {
        self.pool()
            .values()
            .filter_map(|entry| match entry.connector.peek() {
                Some(Ok(connector)) => Some(Arc::clone(connector)),
                _ => None,
            })
            .collect()
    }

    /// Number of pooled slots, pending ones included.
    pub fn len(&self) -> usize {
        self.pool().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool().is_empty()
    }

    /// Tool list for `server`, from the cache when possible.
    ///
    /// Falls back to connecting on the global scope with `config`, or with the
    /// config of an already pooled connector for that server.
    pub async fn get_server_tools(
        &self,
        server: &str,
        config: Option<&McpServerConfig>,
    ) -> Option<Vec<McpTool>> {
        if let Some(tools) = self.cache().tools(server) {
            return Some(tools);
        }

        let config = match config {
            Some(config) => config.clone(),
            None => self
                .pool()
                .values()
                .find(|entry| entry.server == server)
                .map(|entry| entry.config.clone())?,
        };

        let mut configs = HashMap::new();
        configs.insert(server.to_string(), config);
        self.init_connectors(&configs, None, None, false, None)
            .await
            .into_iter()
            .find(|connector| connector.name() == server)
            .map(|connector| connector.tools().to_vec())
    }

    /// Drop the cached listing for `server`, then reconnect it.
    pub async fn reload_single_server(
        &self,
        server: &str,
        config: &McpServerConfig,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
    ) -> Option<Arc<McpConnector>> {
        self.cache().remove(server);
        let mut configs = HashMap::new();
        configs.insert(server.to_string(), config.clone());
        self.init_connectors(&configs, project_dir, task_dir, true, None)
            .await
            .into_iter()
            .next()
    }

    /// Clear the whole cache, then reconnect every configured server.
    pub async fn reload_all_servers(
        &self,
        configs: &HashMap<String, McpServerConfig>,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
    ) -> Vec<Arc<McpConnector>> {
        self.cache().clear();
        self.init_connectors(configs, project_dir, task_dir, true, None)
            .await
    }

    /// Close every pooled connector and empty the pool. Safe to call repeatedly.
    pub async fn close(&self) {
        let entries: Vec<PoolEntry> = self.pool().drain().map(|(_, entry)| entry).collect();
        if entries.is_empty() {
            return;
        }
        tracing::debug!(count = entries.len(), "Closing MCP connectors");

        join_all(entries.into_iter().map(|entry| async move {
            if let Ok(connector) = entry.connector.await
                && let Err(err) = connector.close().await
            {
                tracing::warn!(server = %entry.server, "Failed to close MCP connector: {err}");
            }
        }))
        .await;
    }
}
