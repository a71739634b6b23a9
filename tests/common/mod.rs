#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use fleetlog::errors::TailError;
use fleetlog::managers::pool::ConnectionPool;
use fleetlog::managers::session::{RemoteFileStat, RemoteSession, SessionConnector};
use fleetlog::managers::tailer::LogTailManager;
use fleetlog::services::credentials::{CredentialStore, Credentials};
use fleetlog::services::groups::{ConfiguredInventory, GroupConfigService, HostSourceResolver};
use fleetlog::services::logger::Logger;
use fleetlog::services::mirror::MirrorStore;
use fleetlog::services::offsets::OffsetStore;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

pub fn test_credentials() -> Credentials {
    Credentials {
        username: "ops".to_string(),
        secret: "hunter2".to_string(),
    }
}

/// In-memory stand-in for a fleet of SSH hosts: remote files per host,
/// plus switches to refuse new connections or kill live sessions.
#[derive(Default, Debug)]
pub struct FakeFleet {
    files: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    refuse: Mutex<HashSet<String>>,
    dead: Mutex<HashSet<String>>,
    connects: AtomicUsize,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_file(&self, host: &str, path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .expect("fleet files lock")
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn append_file(&self, host: &str, path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .expect("fleet files lock")
            .entry(host.to_string())
            .or_default()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
    }

    pub fn remove_file(&self, host: &str, path: &str) {
        if let Some(host_files) = self
            .files
            .lock()
            .expect("fleet files lock")
            .get_mut(host)
        {
            host_files.remove(path);
        }
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("fleet files lock")
            .get(host)
            .and_then(|host_files| host_files.get(path).cloned())
    }

    pub fn refuse(&self, host: &str) {
        self.refuse
            .lock()
            .expect("fleet refuse lock")
            .insert(host.to_string());
    }

    pub fn allow(&self, host: &str) {
        self.refuse.lock().expect("fleet refuse lock").remove(host);
    }

    /// Mark every live session for the host as dead; the next connect
    /// clears the flag.
    pub fn kill_sessions(&self, host: &str) {
        self.dead
            .lock()
            .expect("fleet dead lock")
            .insert(host.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn is_dead(&self, host: &str) -> bool {
        self.dead.lock().expect("fleet dead lock").contains(host)
    }
}

#[derive(Debug)]
pub struct FakeSession {
    host: String,
    fleet: Arc<FakeFleet>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&self, command: &str) -> Result<String, TailError> {
        if self.is_closed() {
            return Err(TailError::connection("session closed").with_host(&self.host));
        }
        if command == "echo keepalive" {
            Ok("keepalive\n".to_string())
        } else {
            Err(TailError::internal(format!("unknown command: {}", command)))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, TailError> {
        if self.is_closed() {
            return Err(TailError::connection("session closed").with_host(&self.host));
        }
        let files = self.fleet.files.lock().expect("fleet files lock");
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names = Vec::new();
        if let Some(host_files) = files.get(&self.host) {
            for full in host_files.keys() {
                if let Some(rest) = full.strip_prefix(&prefix) {
                    if !rest.contains('/') {
                        names.push(rest.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn stat(&self, path: &str) -> Result<RemoteFileStat, TailError> {
        if self.is_closed() {
            return Err(TailError::connection("session closed").with_host(&self.host));
        }
        self.fleet
            .file(&self.host, path)
            .map(|bytes| RemoteFileStat {
                size: bytes.len() as u64,
            })
            .ok_or_else(|| TailError::not_found(format!("{}: no such file", path)))
    }

    async fn read_at(&self, path: &str, offset: u64, max_len: usize) -> Result<Bytes, TailError> {
        if self.is_closed() {
            return Err(TailError::connection("session closed").with_host(&self.host));
        }
        let bytes = self
            .fleet
            .file(&self.host, path)
            .ok_or_else(|| TailError::not_found(format!("{}: no such file", path)))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(max_len).min(bytes.len());
        Ok(Bytes::copy_from_slice(&bytes[start..end]))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.fleet.is_dead(&self.host)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    pub fleet: Arc<FakeFleet>,
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        host: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, TailError> {
        if self
            .fleet
            .refuse
            .lock()
            .expect("fleet refuse lock")
            .contains(host)
        {
            return Err(TailError::connection("connection refused").with_host(host));
        }
        self.fleet.dead.lock().expect("fleet dead lock").remove(host);
        self.fleet.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            host: host.to_string(),
            fleet: self.fleet.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Full stack over the fake fleet, rooted in a per-test temp directory.
pub struct Harness {
    pub fleet: Arc<FakeFleet>,
    pub root: PathBuf,
    pub credentials: Arc<CredentialStore>,
    pub pool: Arc<ConnectionPool>,
    pub sources: Arc<HostSourceResolver>,
    pub offsets: Arc<OffsetStore>,
    pub mirrors: Arc<MirrorStore>,
    pub tailer: LogTailManager,
}

pub async fn harness(group_id: &str, hosts: &[(&str, &str)], lines_per_page: u64) -> Harness {
    let fleet = FakeFleet::new();
    let root = tmp_dir("fleetlog-test");
    let groups_dir = root.join("net-conf");
    std::fs::create_dir_all(&groups_dir).expect("create groups dir");

    let mut host_map = serde_json::Map::new();
    for (host, dir) in hosts {
        host_map.insert(
            host.to_string(),
            serde_json::json!({"log_dir": dir, "roles": ["app"]}),
        );
    }
    let config = serde_json::json!({
        "group_id": group_id,
        "node_id": 1,
        "hosts": host_map,
    });
    std::fs::write(
        groups_dir.join(format!("group-{}.json", group_id)),
        serde_json::to_string_pretty(&config).expect("serialize group config"),
    )
    .expect("write group config");

    let logger = Logger::new("test");
    let credentials = Arc::new(CredentialStore::new(
        logger.clone(),
        root.join("ssh_credentials.json"),
    ));
    for (host, _) in hosts {
        credentials
            .put(host, test_credentials())
            .await
            .expect("seed credentials");
    }

    let pool = ConnectionPool::new(
        logger.clone(),
        Arc::new(FakeConnector {
            fleet: fleet.clone(),
        }),
        credentials.clone(),
    );
    let groups = Arc::new(GroupConfigService::new(logger.clone(), groups_dir));
    let inventory = Arc::new(ConfiguredInventory::new(groups.clone()));
    let sources = Arc::new(HostSourceResolver::new(logger.clone(), groups, inventory));
    let offsets = Arc::new(OffsetStore::new(logger.clone(), root.join("log-offsets")));
    let mirrors = Arc::new(MirrorStore::new(logger.clone(), root.join("log-mirrors")));
    let tailer = LogTailManager::new(
        logger,
        pool.clone(),
        sources.clone(),
        offsets.clone(),
        mirrors.clone(),
    )
    .with_lines_per_page(lines_per_page);

    Harness {
        fleet,
        root,
        credentials,
        pool,
        sources,
        offsets,
        mirrors,
        tailer,
    }
}

impl Harness {
    pub fn mirror_bytes(&self, group_id: &str, host: &str, dir: &str, file: &str) -> Vec<u8> {
        std::fs::read(self.mirrors.dir(group_id, host, dir).file_path(file))
            .expect("read mirror file")
    }

    /// The invariants every fetch cycle must uphold for one file.
    pub fn assert_record_invariants(
        &self,
        group_id: &str,
        host: &str,
        dir: &str,
        file: &str,
        lines_per_page: u64,
    ) {
        let records = self.offsets.load(group_id, host, dir);
        let record = records.get(file).expect("offset record present");
        let mirror_len = self
            .mirrors
            .dir(group_id, host, dir)
            .len(file)
            .expect("mirror length");
        assert_eq!(mirror_len, record.offset, "mirror length must equal offset");

        let mut sorted = record.pages.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(record.pages, sorted, "pages must be sorted and de-duplicated");
        assert!(record.pages.contains(&0), "pages must contain 0");
        assert!(
            record.residual_lines < lines_per_page,
            "residual_lines must stay below the page threshold"
        );
    }
}
