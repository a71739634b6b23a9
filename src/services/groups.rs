use crate::constants::cache as cache_constants;
use crate::errors::TailError;
use crate::services::logger::Logger;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `log_dir` in group documents is either one path or a list of paths.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum LogDirs {
    One(String),
    Many(Vec<String>),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub log_dir: Option<LogDirs>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub conf_dir: Option<String>,
    #[serde(default)]
    pub conf_paths: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GroupConfig {
    pub group_id: Value,
    #[serde(default)]
    pub node_id: Option<Value>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,
}

impl GroupConfig {
    /// Documents store group ids as either strings or numbers.
    pub fn group_id_text(&self) -> String {
        value_text(&self.group_id)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Read-only view over the per-group JSON documents in the groups directory.
pub struct GroupConfigService {
    logger: Logger,
    dir: PathBuf,
}

impl GroupConfigService {
    pub fn new(logger: Logger, dir: PathBuf) -> Self {
        Self {
            logger: logger.child("groups"),
            dir,
        }
    }

    pub fn find_by_group_id(&self, group_id: &str) -> Result<GroupConfig, TailError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| {
            TailError::not_found(format!(
                "Group config dir {} is unreadable: {}",
                self.dir.display(),
                err
            ))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    self.logger.error(
                        "Failed to read group config file",
                        Some(&serde_json::json!({
                            "path": path.display().to_string(),
                            "error": err.to_string(),
                        })),
                    );
                    continue;
                }
            };
            let config: GroupConfig = match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    self.logger.error(
                        "Failed to parse group config file",
                        Some(&serde_json::json!({
                            "path": path.display().to_string(),
                            "error": err.to_string(),
                        })),
                    );
                    continue;
                }
            };
            if config.group_id_text() == group_id {
                self.logger.info(
                    "Found group config",
                    Some(&serde_json::json!({
                        "group_id": group_id,
                        "path": path.display().to_string(),
                    })),
                );
                return Ok(config);
            }
        }
        self.logger.warn(
            "No config found for group",
            Some(&serde_json::json!({"group_id": group_id})),
        );
        Err(TailError::not_found(format!(
            "No config found for group_id {}",
            group_id
        )))
    }
}

/// Host discovery boundary. Production wires the monitoring-system client
/// behind this; the shipped implementation answers from the group document.
#[async_trait]
pub trait HostInventory: Send + Sync {
    async fn hosts_in_group(&self, group_id: &str) -> Result<Vec<String>, TailError>;
}

pub struct ConfiguredInventory {
    groups: Arc<GroupConfigService>,
}

impl ConfiguredInventory {
    pub fn new(groups: Arc<GroupConfigService>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl HostInventory for ConfiguredInventory {
    async fn hosts_in_group(&self, group_id: &str) -> Result<Vec<String>, TailError> {
        let config = self.groups.find_by_group_id(group_id)?;
        Ok(config.hosts.keys().cloned().collect())
    }
}

/// One resolved (host, remote log directory) pair for a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostLogSource {
    pub host: String,
    pub log_dir: String,
}

struct CachedSources {
    sources: Vec<HostLogSource>,
    fetched_at: Instant,
}

/// Resolves and caches the host/log-dir expansion for a group. Entries
/// expire after a TTL and can be dropped eagerly via `invalidate` when group
/// membership is known to have changed.
pub struct HostSourceResolver {
    logger: Logger,
    groups: Arc<GroupConfigService>,
    inventory: Arc<dyn HostInventory>,
    cache: dashmap::DashMap<String, CachedSources>,
    ttl: Duration,
}

impl HostSourceResolver {
    pub fn new(
        logger: Logger,
        groups: Arc<GroupConfigService>,
        inventory: Arc<dyn HostInventory>,
    ) -> Self {
        Self {
            logger: logger.child("sources"),
            groups,
            inventory,
            cache: dashmap::DashMap::new(),
            ttl: Duration::from_millis(cache_constants::HOST_CACHE_TTL_MS),
        }
    }

    pub fn invalidate(&self, group_id: &str) {
        self.cache.remove(group_id);
    }

    pub async fn resolve(&self, group_id: &str) -> Result<Vec<HostLogSource>, TailError> {
        if let Some(entry) = self.cache.get(group_id) {
            if entry.fetched_at.elapsed() <= self.ttl {
                return Ok(entry.sources.clone());
            }
        }

        let config = self.groups.find_by_group_id(group_id)?;
        let hosts = self.inventory.hosts_in_group(group_id).await?;

        let mut sources = Vec::new();
        for host in hosts {
            let Some(entry) = config.hosts.get(&host) else {
                continue;
            };
            match &entry.log_dir {
                Some(LogDirs::One(dir)) => sources.push(HostLogSource {
                    host: host.clone(),
                    log_dir: dir.clone(),
                }),
                Some(LogDirs::Many(dirs)) => {
                    for dir in dirs {
                        sources.push(HostLogSource {
                            host: host.clone(),
                            log_dir: dir.clone(),
                        });
                    }
                }
                None => {}
            }
        }

        self.logger.debug(
            "Resolved host sources",
            Some(&serde_json::json!({
                "group_id": group_id,
                "sources": sources.len(),
            })),
        );
        self.cache.insert(
            group_id.to_string(),
            CachedSources {
                sources: sources.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(sources)
    }
}
