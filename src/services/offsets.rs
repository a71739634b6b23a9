use crate::errors::TailError;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::atomic_write_text_file;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Read progress for one remote log file. `offset` always equals the length
/// of the local mirror file; `pages` holds the byte offsets of completed
/// page boundaries, ascending and starting at 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub pages: Vec<u64>,
    #[serde(default)]
    pub prev_page_start: u64,
    #[serde(default)]
    pub residual_lines: u64,
}

impl Default for OffsetRecord {
    fn default() -> Self {
        Self {
            offset: 0,
            pages: vec![0],
            prev_page_start: 0,
            residual_lines: 0,
        }
    }
}

/// Early deployments stored a bare byte offset per file; those records are
/// upgraded on read and rewritten in the structured form on the next save.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Legacy(u64),
    Full(OffsetRecord),
}

impl From<StoredRecord> for OffsetRecord {
    fn from(stored: StoredRecord) -> Self {
        match stored {
            StoredRecord::Legacy(offset) => OffsetRecord {
                offset,
                pages: Vec::new(),
                prev_page_start: 0,
                residual_lines: 0,
            },
            StoredRecord::Full(record) => record,
        }
    }
}

/// One JSON document per (group, host, directory), mapping log file name to
/// its OffsetRecord.
pub struct OffsetStore {
    logger: Logger,
    dir: PathBuf,
}

impl OffsetStore {
    pub fn new(logger: Logger, dir: PathBuf) -> Self {
        Self {
            logger: logger.child("offsets"),
            dir,
        }
    }

    pub fn document_path(&self, group_id: &str, host: &str, log_dir: &str) -> PathBuf {
        let dir_part = log_dir.trim_start_matches('/').replace('/', "_");
        self.dir
            .join(format!("group_{}_{}_{}.json", group_id, host, dir_part))
    }

    pub fn exists(&self, group_id: &str, host: &str, log_dir: &str) -> bool {
        self.document_path(group_id, host, log_dir).exists()
    }

    /// Missing and malformed documents both read as empty; corruption is
    /// logged but never fatal.
    pub fn load(&self, group_id: &str, host: &str, log_dir: &str) -> BTreeMap<String, OffsetRecord> {
        let path = self.document_path(group_id, host, log_dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    self.logger.warn(
                        "Failed to read offset document",
                        Some(&serde_json::json!({
                            "path": path.display().to_string(),
                            "error": err.to_string(),
                        })),
                    );
                }
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<BTreeMap<String, StoredRecord>>(&raw) {
            Ok(parsed) => parsed
                .into_iter()
                .map(|(file, stored)| (file, stored.into()))
                .collect(),
            Err(err) => {
                self.logger.warn(
                    "Malformed offset document, treating as empty",
                    Some(&serde_json::json!({
                        "path": path.display().to_string(),
                        "error": err.to_string(),
                    })),
                );
                BTreeMap::new()
            }
        }
    }

    pub fn save(
        &self,
        group_id: &str,
        host: &str,
        log_dir: &str,
        records: &BTreeMap<String, OffsetRecord>,
    ) -> Result<(), TailError> {
        let path = self.document_path(group_id, host, log_dir);
        let serialized = serde_json::to_string_pretty(records)
            .map_err(|err| TailError::internal(format!("Failed to serialize offsets: {}", err)))?;
        atomic_write_text_file(&path, &format!("{}\n", serialized), 0o644)
            .map_err(|err| TailError::internal(format!("Failed to save offsets: {}", err)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{OffsetRecord, StoredRecord};

    #[test]
    fn legacy_integer_record_upgrades_on_read() {
        let stored: StoredRecord = serde_json::from_str("1024").expect("legacy record");
        let record: OffsetRecord = stored.into();
        assert_eq!(record.offset, 1024);
        assert!(record.pages.is_empty());
        assert_eq!(record.prev_page_start, 0);
        assert_eq!(record.residual_lines, 0);
    }

    #[test]
    fn structured_record_reads_with_missing_fields_defaulted() {
        let stored: StoredRecord =
            serde_json::from_str(r#"{"offset": 7, "pages": [0, 4]}"#).expect("structured record");
        let record: OffsetRecord = stored.into();
        assert_eq!(record.offset, 7);
        assert_eq!(record.pages, vec![0, 4]);
        assert_eq!(record.residual_lines, 0);
    }

    #[test]
    fn default_record_is_first_contact_state() {
        let record = OffsetRecord::default();
        assert_eq!(record.offset, 0);
        assert_eq!(record.pages, vec![0]);
        assert_eq!(record.prev_page_start, 0);
        assert_eq!(record.residual_lines, 0);
    }
}
