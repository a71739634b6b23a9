use rand::{distributions::Alphanumeric, Rng};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub fn ensure_dir_for_file(path: impl AsRef<Path>) -> io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn temp_sibling_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("temp");
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    parent.join(format!("{}.{}.tmp", file_name, token))
}

pub fn atomic_write_text_file(path: impl AsRef<Path>, content: &str, mode: u32) -> io::Result<()> {
    let path = path.as_ref();
    ensure_dir_for_file(path)?;
    let tmp = temp_sibling_path(path);
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{atomic_write_text_file, temp_sibling_path};

    #[test]
    fn temp_sibling_stays_in_parent_dir() {
        let tmp = temp_sibling_path("/some/dir/offsets.json");
        assert_eq!(tmp.parent(), Some(std::path::Path::new("/some/dir")));
        assert!(tmp
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.starts_with("offsets.json.") && s.ends_with(".tmp"))
            .unwrap_or(false));
    }

    #[test]
    fn atomic_write_creates_parent_dirs_and_replaces() {
        let dir = std::env::temp_dir().join(format!("fleetlog-atomic-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("doc.json");
        atomic_write_text_file(&path, "{\"a\":1}\n", 0o644).expect("first write");
        atomic_write_text_file(&path, "{\"a\":2}\n", 0o644).expect("second write");
        let read = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(read, "{\"a\":2}\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
