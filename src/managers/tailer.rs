use crate::constants::network as network_constants;
use crate::constants::tailing as tailing_constants;
use crate::errors::TailError;
use crate::managers::paging;
use crate::managers::pool::ConnectionPool;
use crate::managers::session::RemoteSession;
use crate::services::groups::{HostLogSource, HostSourceResolver};
use crate::services::logger::Logger;
use crate::services::mirror::{MirrorDir, MirrorStore};
use crate::services::offsets::{OffsetRecord, OffsetStore};
use crate::utils::text::strip_ansi_codes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Serialize)]
pub struct HostError {
    pub host: String,
    pub error: String,
}

/// One fetch-cycle page: the freshly read chunk, or the current page when
/// the remote file had nothing new (`is_end`).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchedPage {
    pub content: String,
    pub start_offset: u64,
    pub residual_lines: u64,
    pub is_end: bool,
}

/// A slice of mirrored history, bounded by page boundaries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistorySlice {
    pub content: String,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct FetchOutcome {
    pub logs: BTreeMap<String, BTreeMap<String, FetchedPage>>,
    pub errors: Vec<HostError>,
}

#[derive(Debug, Default, Serialize)]
pub struct HistoryOutcome {
    pub logs: BTreeMap<String, BTreeMap<String, HistorySlice>>,
    pub errors: Vec<HostError>,
}

#[derive(Debug, Default, Serialize)]
pub struct OlderPageOutcome {
    pub logs: BTreeMap<String, BTreeMap<String, HistorySlice>>,
    pub errors: Vec<HostError>,
    /// Set when the requested boundary is already the earliest page.
    pub no_older_page: bool,
}

fn has_log_extension(name: &str) -> bool {
    tailing_constants::LOG_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(ext))
}

fn join_remote(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file)
}

fn source_key(source: &HostLogSource) -> String {
    format!("{}:{}", source.host, source.log_dir)
}

/// Orchestrates the incremental fetch cycle and the read-only query modes
/// for a group's hosts. Hosts are processed concurrently; each host's files
/// sequentially, under that host's channel lock.
pub struct LogTailManager {
    logger: Logger,
    pool: Arc<ConnectionPool>,
    sources: Arc<HostSourceResolver>,
    offsets: Arc<OffsetStore>,
    mirrors: Arc<MirrorStore>,
    lines_per_page: u64,
}

impl LogTailManager {
    pub fn new(
        logger: Logger,
        pool: Arc<ConnectionPool>,
        sources: Arc<HostSourceResolver>,
        offsets: Arc<OffsetStore>,
        mirrors: Arc<MirrorStore>,
    ) -> Self {
        Self {
            logger: logger.child("tailer"),
            pool,
            sources,
            offsets,
            mirrors,
            lines_per_page: tailing_constants::LINES_PER_PAGE,
        }
    }

    pub fn with_lines_per_page(mut self, lines_per_page: u64) -> Self {
        self.lines_per_page = lines_per_page;
        self
    }

    /// Harvest new bytes from every file of every host in the group. A host
    /// that cannot be reached lands in `errors`; the rest still return.
    pub async fn fetch(&self, group_id: &str, fetch_prev_page: bool) -> Result<FetchOutcome, TailError> {
        self.logger.info(
            "Start fetching logs",
            Some(&serde_json::json!({"group_id": group_id})),
        );
        let sources = self.sources.resolve(group_id).await?;
        let mut outcome = FetchOutcome::default();

        let tasks = sources
            .iter()
            .map(|source| self.fetch_host_dir(group_id, source, fetch_prev_page));
        let results = futures::future::join_all(tasks).await;

        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok((logs, file_errors)) => {
                    outcome.errors.extend(file_errors);
                    if !logs.is_empty() {
                        outcome.logs.insert(source_key(source), logs);
                    }
                }
                Err(err) => {
                    self.logger.error(
                        &format!("Error while fetching logs from {}: {}", source.host, err),
                        None,
                    );
                    outcome.errors.push(HostError {
                        host: source.host.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        self.logger.info(
            "Completed log fetching",
            Some(&serde_json::json!({
                "group_id": group_id,
                "hosts": outcome.logs.len(),
                "errors": outcome.errors.len(),
            })),
        );
        Ok(outcome)
    }

    async fn fetch_host_dir(
        &self,
        group_id: &str,
        source: &HostLogSource,
        fetch_prev_page: bool,
    ) -> Result<(BTreeMap<String, FetchedPage>, Vec<HostError>), TailError> {
        let host = &source.host;
        let dir = &source.log_dir;

        let acquired = tokio::time::timeout(
            Duration::from_millis(network_constants::ACQUIRE_TIMEOUT_MS),
            self.pool.get_session(host, None),
        )
        .await;
        let session = match acquired {
            Ok(Ok(Some(session))) => session,
            Ok(Ok(None)) => {
                return Err(TailError::connection("SSH connection failed").with_host(host))
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(TailError::timeout(format!(
                    "Timed out acquiring SSH connection for {}",
                    host
                ))
                .with_host(host))
            }
        };
        let managed = self
            .pool
            .managed(host)
            .ok_or_else(|| TailError::connection("Managed SSH connection not found").with_host(host))?;

        // One file-transfer sub-session at a time on the shared transport.
        let _channel = managed.channel_lock().lock().await;

        let listed = session.list_dir(dir).await?;
        let remote_files: Vec<String> = listed.into_iter().filter(|f| has_log_extension(f)).collect();

        let mirror = self.mirrors.dir(group_id, host, dir);
        let mut records = self.offsets.load(group_id, host, dir);
        let mut logs = BTreeMap::new();
        let mut file_errors = Vec::new();

        for file in &remote_files {
            let result = self
                .fetch_file(&session, &mirror, dir, file, &mut records, fetch_prev_page)
                .await;
            match result {
                Ok(page) => {
                    logs.insert(file.clone(), page);
                }
                Err(err) => {
                    self.logger.error(
                        &format!("Error while fetching {} from {}: {}", file, host, err),
                        None,
                    );
                    file_errors.push(HostError {
                        host: host.clone(),
                        error: format!("{}: {}", file, err),
                    });
                }
            }
        }

        // Drop mirror state for files that no longer exist remotely.
        for local in mirror.list()? {
            if has_log_extension(&local) && !remote_files.contains(&local) {
                mirror.remove(&local)?;
                records.remove(&local);
                self.logger
                    .info(&format!("Removed stale local file: {}", local), None);
            }
        }

        self.offsets.save(group_id, host, dir, &records)?;
        Ok((logs, file_errors))
    }

    async fn fetch_file(
        &self,
        session: &Arc<dyn RemoteSession>,
        mirror: &MirrorDir,
        dir: &str,
        file: &str,
        records: &mut BTreeMap<String, OffsetRecord>,
        fetch_prev_page: bool,
    ) -> Result<FetchedPage, TailError> {
        let remote_path = join_remote(dir, file);
        let mut record = records.get(file).cloned().unwrap_or_default();

        let stat = session.stat(&remote_path).await?;
        if stat.size < record.offset {
            self.logger.warn(
                &format!("Offset reset due to file truncation: {}", remote_path),
                None,
            );
            record = OffsetRecord::default();
            mirror.reset(file)?;
        } else {
            mirror.ensure(file)?;
        }

        if stat.size == record.offset {
            // Nothing new: serve the current page from the mirror.
            let bytes = mirror.read_range(file, record.prev_page_start, record.offset)?;
            let page = FetchedPage {
                content: strip_ansi_codes(&String::from_utf8_lossy(&bytes)),
                start_offset: record.prev_page_start,
                residual_lines: record.residual_lines,
                is_end: true,
            };
            records.insert(file.to_string(), record);
            return Ok(page);
        }

        let chunk = session
            .read_at(&remote_path, record.offset, tailing_constants::FETCH_CHUNK_BYTES)
            .await?;

        // A trailing line without a terminator is deferred to the next
        // cycle so the offset only ever advances past complete lines.
        let complete_len = paging::complete_prefix_len(&chunk);
        let complete = &chunk[..complete_len];

        let (new_boundaries, residual_lines) = paging::scan_page_boundaries(
            complete,
            record.offset,
            record.residual_lines,
            self.lines_per_page,
        );

        mirror.append(file, complete)?;

        paging::merge_page_boundaries(&mut record.pages, &new_boundaries);
        let new_offset = record.offset + complete_len as u64;
        let prev_page_start = paging::prev_page_start(&record.pages, new_offset);

        self.logger.debug(
            "Paged fetched chunk",
            Some(&serde_json::json!({
                "file": file,
                "bytes_read": complete_len,
                "new_offset": new_offset,
                "new_pages": new_boundaries.len(),
                "residual_lines": residual_lines,
            })),
        );

        record.offset = new_offset;
        record.prev_page_start = prev_page_start;
        record.residual_lines = residual_lines;
        records.insert(file.to_string(), record);

        let content = if fetch_prev_page {
            // Pad the reply back to the previous boundary so the caller gets
            // a full page instead of just the delta.
            let bytes = mirror.read_range(file, prev_page_start, new_offset)?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::from_utf8_lossy(complete).into_owned()
        };

        Ok(FetchedPage {
            content: strip_ansi_codes(&content),
            start_offset: prev_page_start,
            residual_lines,
            is_end: false,
        })
    }

    /// Everything harvested so far, one bracketing page per file, straight
    /// from the mirrors — no remote contact.
    pub async fn read_full_history(&self, group_id: &str) -> Result<HistoryOutcome, TailError> {
        let sources = self.sources.resolve(group_id).await?;
        let mut outcome = HistoryOutcome::default();

        for source in &sources {
            if !self.offsets.exists(group_id, &source.host, &source.log_dir) {
                self.logger.warn(
                    &format!(
                        "Offset document missing for {}:{}, skipping",
                        source.host, source.log_dir
                    ),
                    None,
                );
                continue;
            }
            match self.read_host_history(group_id, source) {
                Ok(logs) if !logs.is_empty() => {
                    outcome.logs.insert(source_key(source), logs);
                }
                Ok(_) => {}
                Err(err) => {
                    self.logger.error(
                        &format!(
                            "Error reading logs for group {}, host {}: {}",
                            group_id, source.host, err
                        ),
                        None,
                    );
                    outcome.errors.push(HostError {
                        host: source.host.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    fn read_host_history(
        &self,
        group_id: &str,
        source: &HostLogSource,
    ) -> Result<BTreeMap<String, HistorySlice>, TailError> {
        let records = self.offsets.load(group_id, &source.host, &source.log_dir);
        let mirror = self.mirrors.dir(group_id, &source.host, &source.log_dir);
        let mut logs = BTreeMap::new();

        for (file, record) in &records {
            if record.offset == 0 {
                continue;
            }
            if !mirror.exists(file) {
                self.logger.warn(
                    &format!("Local mirror missing: {}, skipping file", file),
                    None,
                );
                continue;
            }
            let start = paging::prev_page_start(&record.pages, record.offset);
            let bytes = mirror.read_range(file, start, record.offset)?;
            logs.insert(
                file.clone(),
                HistorySlice {
                    content: strip_ansi_codes(&String::from_utf8_lossy(&bytes)),
                    start_offset: start,
                    end_offset: record.offset,
                },
            );
        }
        Ok(logs)
    }

    /// The bracketing page for one mirrored file. Hard-fails with
    /// `not_found` when the offset document, mirror, or record is missing.
    pub async fn read_single(
        &self,
        group_id: &str,
        host: &str,
        dir: &str,
        file: &str,
    ) -> Result<HistoryOutcome, TailError> {
        if !self.offsets.exists(group_id, host, dir) {
            return Err(TailError::not_found(format!(
                "Offset document missing for {}:{}",
                host, dir
            ))
            .with_host(host));
        }
        let mirror = self.mirrors.dir(group_id, host, dir);
        if !mirror.exists(file) {
            return Err(
                TailError::not_found(format!("Local mirror file missing: {}", file)).with_host(host),
            );
        }
        let records = self.offsets.load(group_id, host, dir);
        let record = records.get(file).ok_or_else(|| {
            TailError::not_found(format!("No offset record for log file {}", file)).with_host(host)
        })?;

        let mut outcome = HistoryOutcome::default();
        let key = format!("{}:{}", host, dir);

        if record.offset == 0 {
            outcome.logs.entry(key).or_default().insert(
                file.to_string(),
                HistorySlice {
                    content: String::new(),
                    start_offset: 0,
                    end_offset: 0,
                },
            );
            return Ok(outcome);
        }

        let start = paging::prev_page_start(&record.pages, record.offset);
        let bytes = mirror.read_range(file, start, record.offset)?;
        outcome.logs.entry(key).or_default().insert(
            file.to_string(),
            HistorySlice {
                content: strip_ansi_codes(&String::from_utf8_lossy(&bytes)),
                start_offset: start,
                end_offset: record.offset,
            },
        );
        Ok(outcome)
    }

    /// Navigate one page backwards from a recorded boundary. The given
    /// offset must be a known boundary; the earliest boundary yields the
    /// explicit no-older-page outcome.
    pub async fn read_older_page(
        &self,
        group_id: &str,
        file: &str,
        host: &str,
        dir: &str,
        offset: u64,
    ) -> Result<OlderPageOutcome, TailError> {
        let mirror = self.mirrors.dir(group_id, host, dir);
        if !mirror.exists(file) {
            return Err(
                TailError::not_found(format!("Log file {} not found", file)).with_host(host),
            );
        }
        if !self.offsets.exists(group_id, host, dir) {
            return Err(TailError::not_found(format!(
                "Offset metadata not found for {}",
                file
            ))
            .with_host(host));
        }
        let records = self.offsets.load(group_id, host, dir);
        let record = records.get(file).ok_or_else(|| {
            TailError::not_found(format!("No offset record for log file {}", file)).with_host(host)
        })?;

        let mut pages = record.pages.clone();
        pages.sort_unstable();
        pages.dedup();

        let Some(index) = pages.iter().position(|page| *page == offset) else {
            return Err(TailError::invalid_offset(format!(
                "Offset {} is not a recorded page boundary",
                offset
            ))
            .with_host(host));
        };
        if index == 0 {
            self.logger.info(
                &format!("Offset {} is the first page, no older page", offset),
                None,
            );
            return Ok(OlderPageOutcome {
                no_older_page: true,
                ..OlderPageOutcome::default()
            });
        }

        let start = pages[index - 1];
        let bytes = mirror.read_range(file, start, offset)?;

        let mut outcome = OlderPageOutcome::default();
        outcome
            .logs
            .entry(format!("{}:{}", host, dir))
            .or_default()
            .insert(
                file.to_string(),
                HistorySlice {
                    content: strip_ansi_codes(&String::from_utf8_lossy(&bytes)),
                    start_offset: start,
                    end_offset: offset,
                },
            );
        self.logger.info(
            &format!("Loaded older chunk: {}-{}", start, offset),
            None,
        );
        Ok(outcome)
    }
}
