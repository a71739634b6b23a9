use crate::constants::network as network_constants;
use crate::errors::TailError;
use crate::managers::session::{RemoteSession, SessionConnector};
use crate::services::credentials::{CredentialStore, Credentials};
use crate::services::logger::Logger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Supervises the single remote-shell session for one host: connect and
/// reconnect run under the connect lock, a background keepalive task probes
/// the transport, and the channel lock serializes multi-step sequences on
/// the shared multiplexed connection.
pub struct ManagedConnection {
    host: String,
    credentials: Credentials,
    connector: Arc<dyn SessionConnector>,
    logger: Logger,
    session: Mutex<Option<Arc<dyn RemoteSession>>>,
    channel_lock: Mutex<()>,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ManagedConnection {
    pub fn new(
        host: &str,
        credentials: Credentials,
        connector: Arc<dyn SessionConnector>,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            credentials,
            connector,
            logger,
            session: Mutex::new(None),
            channel_lock: Mutex::new(()),
            keepalive: StdMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Lock that callers must hold for the full duration of a multi-step
    /// remote sequence (open sub-session, read, release).
    pub fn channel_lock(&self) -> &Mutex<()> {
        &self.channel_lock
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), TailError> {
        let mut slot = self.session.lock().await;
        self.connect_locked(&mut slot).await
    }

    async fn connect_locked(
        self: &Arc<Self>,
        slot: &mut MutexGuard<'_, Option<Arc<dyn RemoteSession>>>,
    ) -> Result<(), TailError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TailError::connection("Connection is closed").with_host(&self.host));
        }
        if let Some(session) = slot.as_ref() {
            if !session.is_closed() {
                return Ok(());
            }
        }
        self.logger.info(
            &format!("Connecting to {} as {}", self.host, self.credentials.username),
            None,
        );
        match self.connector.connect(&self.host, &self.credentials).await {
            Ok(session) => {
                **slot = Some(session);
                self.logger.info(&format!("Connected to {}", self.host), None);
                self.spawn_keepalive_if_needed();
                Ok(())
            }
            Err(err) => {
                **slot = None;
                self.logger.error(
                    &format!("Failed to connect to {}: {}", self.host, err),
                    None,
                );
                Err(err)
            }
        }
    }

    fn spawn_keepalive_if_needed(self: &Arc<Self>) {
        let mut guard = self.keepalive.lock().unwrap_or_else(|err| err.into_inner());
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let conn = self.clone();
        *guard = Some(tokio::spawn(async move {
            conn.keepalive_loop().await;
        }));
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let period = Duration::from_millis(network_constants::KEEPALIVE_INTERVAL_MS);
        loop {
            tokio::time::sleep(period).await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let mut slot = self.session.lock().await;
            let live = slot.as_ref().filter(|s| !s.is_closed()).cloned();
            match live {
                None => {
                    self.logger.warn(
                        &format!("Connection lost to {}, reconnecting", self.host),
                        None,
                    );
                    if let Err(err) = self.connect_locked(&mut slot).await {
                        self.logger.error(
                            &format!("Reconnection failed for {}: {}", self.host, err),
                            None,
                        );
                    }
                }
                Some(session) => match session.run("echo keepalive").await {
                    Ok(reply) if reply.trim() == "keepalive" => {}
                    Ok(reply) => {
                        self.logger.warn(
                            &format!(
                                "Unexpected keepalive response from {}: {}, reconnecting",
                                self.host,
                                reply.trim()
                            ),
                            None,
                        );
                        session.close().await;
                        if let Err(err) = self.connect_locked(&mut slot).await {
                            self.logger.error(
                                &format!("Reconnection failed for {}: {}", self.host, err),
                                None,
                            );
                        }
                    }
                    Err(err) => {
                        self.logger.warn(
                            &format!(
                                "Keepalive command failed for {}: {}, reconnecting",
                                self.host, err
                            ),
                            None,
                        );
                        session.close().await;
                        if let Err(err) = self.connect_locked(&mut slot).await {
                            self.logger.error(
                                &format!("Reconnection failed for {}: {}", self.host, err),
                                None,
                            );
                        }
                    }
                },
            }
        }
        self.logger
            .info(&format!("Keepalive loop stopped for {}", self.host), None);
    }

    /// The live session handle, reconnecting first when the current one is
    /// missing or closing.
    pub async fn get(self: &Arc<Self>) -> Result<Arc<dyn RemoteSession>, TailError> {
        let mut slot = self.session.lock().await;
        let valid = slot.as_ref().map(|s| !s.is_closed()).unwrap_or(false);
        if !valid {
            self.logger.info(
                &format!("Connection invalid for {}, reconnecting", self.host),
                None,
            );
            self.connect_locked(&mut slot).await?;
        }
        slot.as_ref()
            .cloned()
            .ok_or_else(|| TailError::connection("SSH session unavailable").with_host(&self.host))
    }

    /// Idempotent: stops the keepalive task, then closes the session.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handle = self
            .keepalive
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.close().await;
            self.logger
                .info(&format!("Closed connection to {}", self.host), None);
        }
    }
}

/// Owns every ManagedConnection, keyed by host address. The map handles its
/// own structural locking; per-host I/O always happens under the managed
/// connection's locks so slow hosts never block pool lookups.
pub struct ConnectionPool {
    logger: Logger,
    connector: Arc<dyn SessionConnector>,
    credentials: Arc<CredentialStore>,
    entries: dashmap::DashMap<String, Arc<ManagedConnection>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Must be called from within a runtime: the idle sweep task is spawned
    /// here.
    pub fn new(
        logger: Logger,
        connector: Arc<dyn SessionConnector>,
        credentials: Arc<CredentialStore>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            logger: logger.child("pool"),
            connector,
            credentials,
            entries: dashmap::DashMap::new(),
            sweeper: StdMutex::new(None),
        });
        pool.spawn_sweeper();
        pool.logger.info(
            "Initialized connection pool",
            Some(&serde_json::json!({
                "idle_timeout_ms": network_constants::IDLE_TIMEOUT_MS,
                "sweep_interval_ms": network_constants::SWEEP_INTERVAL_MS,
            })),
        );
        pool
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(network_constants::SWEEP_INTERVAL_MS);
            loop {
                tokio::time::sleep(period).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.sweep_idle();
            }
        });
        *self.sweeper.lock().unwrap_or_else(|err| err.into_inner()) = Some(handle);
    }

    /// Eviction is intentionally disabled: connections stay warm for the
    /// life of the process. This pass is the enforcement point if an idle
    /// timeout is ever turned on.
    fn sweep_idle(&self) {
        self.logger.debug(
            "Idle sweep",
            Some(&serde_json::json!({"connections": self.entries.len()})),
        );
    }

    /// Acquire the live session for a host. Missing credentials resolve
    /// through the credential store; a host that cannot be reached yields
    /// `Ok(None)` so multi-host callers can skip it and keep going.
    pub async fn get_session(
        &self,
        host: &str,
        credentials: Option<Credentials>,
    ) -> Result<Option<Arc<dyn RemoteSession>>, TailError> {
        let credentials = match credentials {
            Some(credentials) => credentials,
            None => match self.credentials.get(host).await {
                Some(credentials) => credentials,
                None => {
                    self.logger
                        .warn(&format!("No credentials for {}", host), None);
                    return Err(TailError::credentials_not_found(host));
                }
            },
        };

        let managed = {
            let entry = self.entries.entry(host.to_string()).or_insert_with(|| {
                ManagedConnection::new(
                    host,
                    credentials.clone(),
                    self.connector.clone(),
                    self.logger.clone(),
                )
            });
            entry.value().clone()
        };

        let managed = if *managed.credentials() != credentials {
            self.logger.info(
                &format!("Credentials changed for {}, reconnecting", host),
                None,
            );
            managed.close().await;
            let replacement = ManagedConnection::new(
                host,
                credentials.clone(),
                self.connector.clone(),
                self.logger.clone(),
            );
            self.entries.insert(host.to_string(), replacement.clone());
            replacement
        } else {
            managed
        };

        match managed.get().await {
            Ok(session) => {
                self.credentials.put(host, credentials).await?;
                Ok(Some(session))
            }
            Err(err) => {
                self.logger.error(
                    &format!("Failed to get connection for {}: {}", host, err),
                    None,
                );
                Ok(None)
            }
        }
    }

    pub fn managed(&self, host: &str) -> Option<Arc<ManagedConnection>> {
        self.entries.get(host).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close one host's connection and forget its persisted credentials.
    pub async fn close_connection(&self, host: &str) -> Result<(), TailError> {
        if let Some((_, managed)) = self.entries.remove(host) {
            managed.close().await;
            self.credentials.remove(host).await?;
            self.logger
                .info(&format!("Removed connection for {}", host), None);
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        self.logger.info("Closing all SSH connections", None);
        let hosts: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            if let Some((_, managed)) = self.entries.remove(&host) {
                managed.close().await;
            }
        }
    }

    /// Process shutdown: stop the sweeper, then close every connection.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.close_all().await;
    }
}
