use std::env;
use std::path::PathBuf;

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn resolve_xdg_state_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_STATE_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".local").join("state"))
}

pub fn resolve_data_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETLOG_DATA_DIR").ok()) {
        return path;
    }
    if let Some(path) = resolve_xdg_state_dir() {
        return path.join("fleetlog");
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_groups_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETLOG_GROUPS_DIR").ok()) {
        return path;
    }
    resolve_data_dir().join("net-conf")
}

pub fn resolve_credentials_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETLOG_CREDENTIALS_PATH").ok()) {
        return path;
    }
    resolve_data_dir().join("ssh_credentials.json")
}

pub fn resolve_offsets_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETLOG_OFFSETS_DIR").ok()) {
        return path;
    }
    resolve_data_dir().join("log-offsets")
}

pub fn resolve_mirrors_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETLOG_MIRRORS_DIR").ok()) {
        return path;
    }
    resolve_data_dir().join("log-mirrors")
}
