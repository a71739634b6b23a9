use crate::errors::TailError;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::atomic_write_text_file;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// File-backed map from host address to login credentials. Every
/// read-modify-write cycle runs under one process-wide lock so concurrent
/// pool operations cannot interleave partial updates.
pub struct CredentialStore {
    logger: Logger,
    file_path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(logger: Logger, file_path: PathBuf) -> Self {
        Self {
            logger: logger.child("credentials"),
            file_path,
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> BTreeMap<String, Credentials> {
        let raw = match std::fs::read_to_string(&self.file_path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    self.logger.warn(
                        "Failed to read credential store",
                        Some(&serde_json::json!({"error": err.to_string()})),
                    );
                }
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                self.logger.warn(
                    "Malformed credential store, treating as empty",
                    Some(&serde_json::json!({"error": err.to_string()})),
                );
                BTreeMap::new()
            }
        }
    }

    fn write_map(&self, map: &BTreeMap<String, Credentials>) -> Result<(), TailError> {
        let serialized = serde_json::to_string_pretty(map)
            .map_err(|err| TailError::internal(format!("Failed to serialize credentials: {}", err)))?;
        atomic_write_text_file(&self.file_path, &format!("{}\n", serialized), 0o600)
            .map_err(|err| TailError::internal(format!("Failed to save credentials: {}", err)))?;
        Ok(())
    }

    pub async fn get(&self, host: &str) -> Option<Credentials> {
        let _guard = self.lock.lock().await;
        self.read_map().get(host).cloned()
    }

    pub async fn put(&self, host: &str, credentials: Credentials) -> Result<(), TailError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map();
        if map.get(host) == Some(&credentials) {
            return Ok(());
        }
        map.insert(host.to_string(), credentials);
        self.write_map(&map)
    }

    /// Partial update used when an operator rotates a password or renames an
    /// account. Returns false when the host has no stored entry.
    pub async fn update(
        &self,
        host: &str,
        username: Option<&str>,
        secret: Option<&str>,
    ) -> Result<bool, TailError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map();
        let Some(entry) = map.get_mut(host) else {
            return Ok(false);
        };
        if let Some(username) = username {
            entry.username = username.to_string();
        }
        if let Some(secret) = secret {
            entry.secret = secret.to_string();
        }
        self.write_map(&map)?;
        Ok(true)
    }

    pub async fn remove(&self, host: &str) -> Result<(), TailError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map();
        if map.remove(host).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}
