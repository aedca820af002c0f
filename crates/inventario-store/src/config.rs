//! Store configuration
//!
//! Paths default to the platform data directory; each value can be
//! overridden through the environment:
//! - `INVENTARIO_DB_PATH`: live database file
//! - `INVENTARIO_BACKUP_DIR`: directory for automatic backups
//! - `INVENTARIO_BUSY_TIMEOUT_MS`: SQLite busy timeout

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application data directory name
const APP_DIR_NAME: &str = "Inventario";

/// Database file name inside the data directory
const DB_FILE_NAME: &str = "inventario.db";

const BACKUP_DIR_NAME: &str = "backups";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub const ENV_DB_PATH: &str = "INVENTARIO_DB_PATH";
pub const ENV_BACKUP_DIR: &str = "INVENTARIO_BACKUP_DIR";
pub const ENV_BUSY_TIMEOUT_MS: &str = "INVENTARIO_BUSY_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Live database file
    pub db_path: PathBuf,
    /// Where automatic backups are written
    pub backup_dir: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    /// Configuration for a database at `db_path`, with backups in a
    /// `backups/` directory next to it.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let backup_dir = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(BACKUP_DIR_NAME);
        Self {
            db_path,
            backup_dir,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = backup_dir.into();
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Build the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup(ENV_DB_PATH)
            .filter(|v| !v.trim().is_empty())
            .map_or_else(get_db_path, PathBuf::from);

        let mut config = Self::new(db_path);

        if let Some(dir) = lookup(ENV_BACKUP_DIR).filter(|v| !v.trim().is_empty()) {
            config.backup_dir = PathBuf::from(dir);
        }

        match lookup(ENV_BUSY_TIMEOUT_MS).map(|v| v.trim().parse::<u64>()) {
            Some(Ok(ms)) => config.busy_timeout = Duration::from_millis(ms),
            Some(Err(e)) => {
                tracing::warn!("Ignoring invalid {}: {}", ENV_BUSY_TIMEOUT_MS, e);
            }
            None => {}
        }

        config
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(get_db_path())
    }
}

/// Get the application data directory
///
/// Falls back to the working directory when the platform has no data dir.
pub fn get_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Get database path
pub fn get_db_path() -> PathBuf {
    get_app_data_dir().join(DB_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn backup_dir_defaults_next_to_database() {
        let config = StoreConfig::new("/srv/tienda/inventario.db");
        assert_eq!(config.backup_dir, PathBuf::from("/srv/tienda/backups"));
        assert_eq!(config.busy_timeout, DEFAULT_BUSY_TIMEOUT);
    }

    #[test]
    fn environment_overrides_apply() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/data/tienda.db"),
            (ENV_BACKUP_DIR, "/mnt/respaldos"),
            (ENV_BUSY_TIMEOUT_MS, "250"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/data/tienda.db"));
        assert_eq!(config.backup_dir, PathBuf::from("/mnt/respaldos"));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_timeout_keeps_default() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/data/tienda.db"),
            (ENV_BUSY_TIMEOUT_MS, "pronto"),
        ]));
        assert_eq!(config.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config.backup_dir, PathBuf::from("/data/backups"));
    }

    #[test]
    fn empty_db_path_falls_back_to_data_dir() {
        let config = StoreConfig::from_lookup(lookup_from(&[(ENV_DB_PATH, "  ")]));
        assert_eq!(config.db_path, get_db_path());
    }
}
