use crate::constants::network as network_constants;
use crate::errors::TailError;
use crate::services::credentials::Credentials;
use async_trait::async_trait;
use bytes::Bytes;
use ssh2::Session;
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub size: u64,
}

/// One live remote-shell session. Implementations must be safe to share
/// across tasks; the pool serializes multi-step sequences via the managed
/// connection's channel lock, not here.
#[async_trait]
pub trait RemoteSession: Send + Sync + std::fmt::Debug {
    /// Execute a command and return its combined stdout.
    async fn run(&self, command: &str) -> Result<String, TailError>;
    /// Names of the direct entries of a remote directory.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, TailError>;
    async fn stat(&self, path: &str) -> Result<RemoteFileStat, TailError>;
    /// Read at most `max_len` bytes starting at `offset`.
    async fn read_at(&self, path: &str, offset: u64, max_len: usize) -> Result<Bytes, TailError>;
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

/// Dials a host and produces a session. The pool owns exactly one connector
/// and reuses it for every host.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, TailError>;
}

fn map_session_error(host: &str, err: ssh2::Error) -> TailError {
    TailError::connection(err.to_string()).with_host(host)
}

fn map_sftp_error(host: &str, path: &str, err: ssh2::Error) -> TailError {
    match err.code() {
        // SSH_FX_NO_SUCH_FILE
        ssh2::ErrorCode::SFTP(2) => {
            TailError::not_found(format!("{}: {}", path, err)).with_host(host)
        }
        ssh2::ErrorCode::SFTP(_) => {
            TailError::internal(format!("{}: {}", path, err)).with_host(host)
        }
        _ => TailError::connection(err.to_string()).with_host(host),
    }
}

fn connect_blocking(host: &str, credentials: &Credentials) -> Result<Session, TailError> {
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, network_constants::SSH_DEFAULT_PORT)
    };
    let ready_timeout = Duration::from_millis(network_constants::TIMEOUT_SSH_READY_MS);
    let tcp = TcpStream::connect_timeout(
        &addr
            .parse()
            .map_err(|_| TailError::invalid_params(format!("Invalid SSH host address: {}", addr)))?,
        ready_timeout,
    )
    .map_err(|err| TailError::connection(format!("Failed to connect SSH: {}", err)).with_host(host))?;
    tcp.set_read_timeout(Some(ready_timeout)).ok();
    tcp.set_write_timeout(Some(ready_timeout)).ok();

    let mut session =
        Session::new().map_err(|_| TailError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| map_session_error(host, err))?;
    session
        .userauth_password(&credentials.username, &credentials.secret)
        .map_err(|err| map_session_error(host, err))?;
    if !session.authenticated() {
        return Err(TailError::connection("SSH authentication failed").with_host(host));
    }
    session.set_keepalive(true, network_constants::KEEPALIVE_PROBE_INTERVAL_SECS);
    Ok(session)
}

/// `RemoteSession` over libssh2. Every libssh2 call runs on the blocking
/// thread pool; the inner mutex keeps concurrent callers off the
/// single multiplexed transport.
pub struct Ssh2Session {
    host: String,
    inner: Arc<Mutex<Session>>,
    closed: AtomicBool,
    broken: AtomicBool,
}

impl std::fmt::Debug for Ssh2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Session")
            .field("host", &self.host)
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Ssh2Session {
    fn new(host: String, session: Session) -> Self {
        Self {
            host,
            inner: Arc::new(Mutex::new(session)),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    fn note_failure(&self, err: &TailError) {
        if err.kind == crate::errors::TailErrorKind::Connection {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    async fn blocking<T, F>(&self, label: &str, work: F) -> Result<T, TailError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, TailError> + Send + 'static,
    {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let session = inner.lock().unwrap_or_else(|err| err.into_inner());
            work(&session)
        })
        .await
        .map_err(|_| TailError::internal(format!("SSH {} task failed", label)))?;
        if let Err(err) = result.as_ref() {
            self.note_failure(err);
        }
        result
    }
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn run(&self, command: &str) -> Result<String, TailError> {
        let host = self.host.clone();
        let command = command.to_string();
        self.blocking("exec", move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|err| map_session_error(&host, err))?;
            channel
                .exec(&command)
                .map_err(|err| map_session_error(&host, err))?;
            let mut output = String::new();
            channel
                .read_to_string(&mut output)
                .map_err(|err| TailError::connection(err.to_string()).with_host(&host))?;
            channel.wait_close().ok();
            Ok(output)
        })
        .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, TailError> {
        let host = self.host.clone();
        let path = path.to_string();
        self.blocking("listdir", move |session| {
            let sftp = session.sftp().map_err(|err| map_session_error(&host, err))?;
            let entries = sftp
                .readdir(Path::new(&path))
                .map_err(|err| map_sftp_error(&host, &path, err))?;
            let mut names = Vec::new();
            for (entry_path, _stat) in entries {
                if let Some(name) = entry_path.file_name().and_then(|s| s.to_str()) {
                    names.push(name.to_string());
                }
            }
            Ok(names)
        })
        .await
    }

    async fn stat(&self, path: &str) -> Result<RemoteFileStat, TailError> {
        let host = self.host.clone();
        let path = path.to_string();
        self.blocking("stat", move |session| {
            let sftp = session.sftp().map_err(|err| map_session_error(&host, err))?;
            let stat = sftp
                .stat(Path::new(&path))
                .map_err(|err| map_sftp_error(&host, &path, err))?;
            Ok(RemoteFileStat {
                size: stat.size.unwrap_or(0),
            })
        })
        .await
    }

    async fn read_at(&self, path: &str, offset: u64, max_len: usize) -> Result<Bytes, TailError> {
        let host = self.host.clone();
        let path = path.to_string();
        self.blocking("read", move |session| {
            let sftp = session.sftp().map_err(|err| map_session_error(&host, err))?;
            let mut file = sftp
                .open(Path::new(&path))
                .map_err(|err| map_sftp_error(&host, &path, err))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| TailError::connection(err.to_string()).with_host(&host))?;
            let mut buf = vec![0u8; max_len];
            let mut filled = 0usize;
            while filled < max_len {
                let n = file
                    .read(&mut buf[filled..])
                    .map_err(|err| TailError::connection(err.to_string()).with_host(&host))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.broken.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let session = inner.lock().unwrap_or_else(|err| err.into_inner());
            let _ = session.disconnect(None, "closing", None);
        })
        .await;
    }
}

/// The production connector.
pub struct Ssh2Connector;

#[async_trait]
impl SessionConnector for Ssh2Connector {
    async fn connect(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, TailError> {
        let host_owned = host.to_string();
        let credentials = credentials.clone();
        let session =
            tokio::task::spawn_blocking(move || connect_blocking(&host_owned, &credentials))
                .await
                .map_err(|_| TailError::internal("SSH connect task failed"))??;
        Ok(Arc::new(Ssh2Session::new(host.to_string(), session)))
    }
}
