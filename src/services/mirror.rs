use crate::errors::TailError;
use crate::services::logger::Logger;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Local byte-for-byte copies of the consumed prefix of remote log files,
/// laid out as one directory per (group, host, remote directory).
pub struct MirrorStore {
    logger: Logger,
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(logger: Logger, root: PathBuf) -> Self {
        Self {
            logger: logger.child("mirror"),
            root,
        }
    }

    pub fn dir(&self, group_id: &str, host: &str, log_dir: &str) -> MirrorDir {
        let dir_part = log_dir.trim_start_matches('/');
        MirrorDir {
            logger: self.logger.clone(),
            path: self
                .root
                .join(format!("group_{}_{}", group_id, host))
                .join(dir_part),
        }
    }
}

/// Handle on the mirror directory for one (group, host, remote directory).
pub struct MirrorDir {
    logger: Logger,
    path: PathBuf,
}

impl MirrorDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_path(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }

    pub fn exists(&self, file: &str) -> bool {
        self.file_path(file).exists()
    }

    /// Create the mirror file (empty) if it is not there yet.
    pub fn ensure(&self, file: &str) -> Result<(), TailError> {
        fs::create_dir_all(&self.path)
            .map_err(|err| TailError::internal(format!("Failed to create mirror dir: {}", err)))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(file))
            .map_err(|err| TailError::internal(format!("Failed to create mirror file: {}", err)))?;
        Ok(())
    }

    /// Truncate the mirror back to empty after remote truncation.
    pub fn reset(&self, file: &str) -> Result<(), TailError> {
        fs::create_dir_all(&self.path)
            .map_err(|err| TailError::internal(format!("Failed to create mirror dir: {}", err)))?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.file_path(file))
            .map_err(|err| TailError::internal(format!("Failed to reset mirror file: {}", err)))?;
        Ok(())
    }

    pub fn append(&self, file: &str, bytes: &[u8]) -> Result<(), TailError> {
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(file))
            .map_err(|err| TailError::internal(format!("Failed to open mirror file: {}", err)))?;
        handle
            .write_all(bytes)
            .map_err(|err| TailError::internal(format!("Failed to append to mirror: {}", err)))?;
        Ok(())
    }

    pub fn read_range(&self, file: &str, start: u64, end: u64) -> Result<Vec<u8>, TailError> {
        let path = self.file_path(file);
        let mut handle = fs::File::open(&path).map_err(|err| {
            TailError::internal(format!(
                "Failed to open mirror file {}: {}",
                path.display(),
                err
            ))
        })?;
        handle
            .seek(SeekFrom::Start(start))
            .map_err(|err| TailError::internal(format!("Failed to seek mirror: {}", err)))?;
        let mut buf = Vec::new();
        handle
            .take(end.saturating_sub(start))
            .read_to_end(&mut buf)
            .map_err(|err| TailError::internal(format!("Failed to read mirror: {}", err)))?;
        Ok(buf)
    }

    pub fn len(&self, file: &str) -> Result<u64, TailError> {
        let meta = fs::metadata(self.file_path(file))
            .map_err(|err| TailError::internal(format!("Failed to stat mirror file: {}", err)))?;
        Ok(meta.len())
    }

    pub fn remove(&self, file: &str) -> Result<(), TailError> {
        match fs::remove_file(self.file_path(file)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TailError::internal(format!(
                "Failed to remove mirror file: {}",
                err
            ))),
        }
    }

    /// Names of mirrored files currently on disk; empty when the directory
    /// has never been created.
    pub fn list(&self) -> Result<Vec<String>, TailError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(TailError::internal(format!(
                    "Failed to list mirror dir: {}",
                    err
                )))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| TailError::internal(format!("Failed to list mirror dir: {}", err)))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            } else {
                self.logger.debug(
                    "Skipping non-file mirror entry",
                    Some(&serde_json::json!({
                        "entry": entry.file_name().to_string_lossy(),
                    })),
                );
            }
        }
        names.sort();
        Ok(names)
    }
}
