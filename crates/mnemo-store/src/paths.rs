use std::env;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "MNEMO_DATA_DIR";

/// `$MNEMO_DATA_DIR`, else `~/.mnemo`.
pub fn default_base_dir() -> PathBuf {
    match env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs_home().join(".mnemo"),
    }
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub fn database_path(base: &Path) -> PathBuf {
    base.join("mnemo.db")
}

pub fn config_path(base: &Path) -> PathBuf {
    base.join("config.toml")
}
