use crate::errors::TailError;
use crate::managers::pool::ConnectionPool;
use crate::managers::session::{SessionConnector, Ssh2Connector};
use crate::managers::tailer::LogTailManager;
use crate::services::credentials::CredentialStore;
use crate::services::groups::{ConfiguredInventory, GroupConfigService, HostSourceResolver};
use crate::services::logger::Logger;
use crate::services::mirror::MirrorStore;
use crate::services::offsets::OffsetStore;
use crate::utils::paths::{
    resolve_credentials_path, resolve_groups_dir, resolve_mirrors_dir, resolve_offsets_dir,
};
use std::sync::Arc;

pub struct App {
    pub logger: Logger,
    pub credentials: Arc<CredentialStore>,
    pub pool: Arc<ConnectionPool>,
    pub groups: Arc<GroupConfigService>,
    pub sources: Arc<HostSourceResolver>,
    pub tailer: Arc<LogTailManager>,
}

impl App {
    /// Wire the full stack against the real SSH transport. Must run inside
    /// a runtime; the pool spawns its maintenance task here.
    pub fn initialize() -> Result<Self, TailError> {
        Self::initialize_with_connector(Arc::new(Ssh2Connector))
    }

    pub fn initialize_with_connector(
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self, TailError> {
        let logger = Logger::new("fleetlog");

        let credentials = Arc::new(CredentialStore::new(
            logger.clone(),
            resolve_credentials_path(),
        ));
        let pool = ConnectionPool::new(logger.clone(), connector, credentials.clone());

        let groups = Arc::new(GroupConfigService::new(logger.clone(), resolve_groups_dir()));
        let inventory = Arc::new(ConfiguredInventory::new(groups.clone()));
        let sources = Arc::new(HostSourceResolver::new(
            logger.clone(),
            groups.clone(),
            inventory,
        ));

        let offsets = Arc::new(OffsetStore::new(logger.clone(), resolve_offsets_dir()));
        let mirrors = Arc::new(MirrorStore::new(logger.clone(), resolve_mirrors_dir()));
        let tailer = Arc::new(LogTailManager::new(
            logger.clone(),
            pool.clone(),
            sources.clone(),
            offsets,
            mirrors,
        ));

        Ok(Self {
            logger,
            credentials,
            pool,
            groups,
            sources,
            tailer,
        })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
