//! Configuration types and JSON config-file loading.
//!
//! All config structs deserialize from JSON with serde; unknown fields are
//! rejected so typos in config files surface instead of silently doing
//! nothing. File discovery follows the platform config-directory rules in
//! [`crate::dirs`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dirs;
use crate::errors::{labels, Error, ErrorKind, Result};
use crate::util;

/// Relative path of the config file within a config directory.
pub const CONFIG_FILE_RELATIVE_PATH: &str = "gantry/config.json";

fn default_size_limit_mib() -> u64 {
    1024
}

/// Sizing of the in-memory immutable cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImmutableCacheConfig {
    /// Cap on memory retained for unused entries, in MiB.
    #[serde(default = "default_size_limit_mib")]
    pub size_limit_mib: u64,
}

impl ImmutableCacheConfig {
    pub fn size_limit_bytes(&self) -> usize {
        self.size_limit_mib as usize * (1 << 20)
    }
}

impl Default for ImmutableCacheConfig {
    fn default() -> Self {
        Self {
            size_limit_mib: default_size_limit_mib(),
        }
    }
}

/// Sizing and placement of the local disk cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskCacheConfig {
    /// Directory holding the cache; a platform default is chosen if unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Cap on disk usage, in bytes.
    pub size_limit: u64,
}

/// Configuration of a [`crate::service::ServiceCore`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub immutable_cache: Option<ImmutableCacheConfig>,
    #[serde(default)]
    pub disk_cache: Option<DiskCacheConfig>,
}

/// Configuration of the WebSocket server binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Whether to accept connections from other machines.
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub immutable_cache: Option<ImmutableCacheConfig>,
    #[serde(default)]
    pub disk_cache: Option<DiskCacheConfig>,
}

impl ServerConfig {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            immutable_cache: self.immutable_cache.clone(),
            disk_cache: self.disk_cache.clone(),
        }
    }
}

/// Loads a server config from a JSON file.
pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let contents = util::read_text_file(path)?;
    serde_json::from_str(&contents).map_err(|e| {
        Error::new(ErrorKind::Parse)
            .with_info(labels::PATH, path.display())
            .with_info(labels::INTERNAL_MESSAGE, e)
    })
}

/// Finds the config file through the platform config directories.
pub fn find_config_file() -> Option<PathBuf> {
    dirs::find_config_item(Path::new(CONFIG_FILE_RELATIVE_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.open);
        assert_eq!(config.port, None);
        assert_eq!(config.immutable_cache, None);

        let cache: ImmutableCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cache.size_limit_mib, 1024);
        assert_eq!(cache.size_limit_bytes(), 1024 << 20);
    }

    #[test]
    fn full_config_parses() {
        let json = r#"{
            "open": true,
            "port": 41071,
            "immutable_cache": {"size_limit_mib": 256},
            "disk_cache": {"directory": "/var/cache/gantry", "size_limit": 4096}
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(config.open);
        assert_eq!(config.port, Some(41071));
        assert_eq!(
            config.immutable_cache.unwrap().size_limit_mib,
            256
        );
        let disk = config.disk_cache.unwrap();
        assert_eq!(disk.directory, Some(PathBuf::from("/var/cache/gantry")));
        assert_eq!(disk.size_limit, 4096);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<ServerConfig>(r#"{"prot": 99}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn loading_reports_parse_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = load_server_config(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(err.info(labels::PATH).is_some());

        let missing = dir.path().join("absent.json");
        assert_eq!(
            load_server_config(&missing).unwrap_err().kind(),
            ErrorKind::OpenFile
        );
    }
}
