//! Per data directory configuration files.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parley_core::{PluginId, Secret};
use parley_logging::parley_info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::persist::{AtomicFileWriter, PersistError};

pub const USER_CONFIG_FILE: &str = "config.json";
pub const PLUGINS_CONFIG_FILE: &str = "plugins.json";
pub const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Reads a JSON file, falling back to `T::default()` when it does not exist.
fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PluginEntry {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PluginsConfig {
    #[serde(default)]
    pub plugins: BTreeMap<PluginId, PluginEntry>,
}

impl PluginsConfig {
    pub fn enabled(&self) -> BTreeSet<PluginId> {
        self.plugins
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Durable per-plugin enabled flags (`plugins.json`).
#[derive(Debug, Clone)]
pub struct PluginConfigStore {
    path: PathBuf,
    writer: AtomicFileWriter,
}

impl PluginConfigStore {
    /// Opens the store and checks that the existing file (if any) parses.
    pub fn open(data_dir: &Path) -> Result<Self, ConfigError> {
        let store = Self {
            path: data_dir.join(PLUGINS_CONFIG_FILE),
            writer: AtomicFileWriter::new(data_dir.to_path_buf()),
        };
        store.load()?;
        Ok(store)
    }

    pub fn load(&self) -> Result<PluginsConfig, ConfigError> {
        read_json_or_default(&self.path)
    }

    pub fn save(&self, config: &PluginsConfig) -> Result<(), ConfigError> {
        self.writer.write_json(PLUGINS_CONFIG_FILE, config)?;
        Ok(())
    }

    pub fn set_plugin_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config
            .plugins
            .entry(plugin_id.to_string())
            .or_default()
            .enabled = enabled;
        self.save(&config)?;
        parley_info!("Plugin '{}' saved as enabled={}", plugin_id, enabled);
        Ok(())
    }

    pub fn enabled_plugins(&self) -> Result<BTreeSet<PluginId>, ConfigError> {
        Ok(self.load()?.enabled())
    }
}

/// How to launch one plugin tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: PluginId,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Installed plugins (`registry.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PluginRegistry {
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

impl PluginRegistry {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        read_json_or_default(&data_dir.join(REGISTRY_FILE))
    }

    pub fn get(&self, plugin_id: &str) -> Option<&PluginSpec> {
        self.plugins.iter().find(|spec| spec.id == plugin_id)
    }
}

fn default_model() -> String {
    "llama3".to_string()
}

/// Data directory settings (`config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub models: Vec<String>,
    /// Models that accept tool definitions.
    #[serde(default)]
    pub tool_models: Vec<String>,
    #[serde(default)]
    pub plugins_enabled: bool,
    /// Hex SHA-256 of the passphrase protecting this directory's credentials.
    #[serde(default)]
    pub passphrase_sha256: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            models: Vec::new(),
            tool_models: Vec::new(),
            plugins_enabled: false,
            passphrase_sha256: None,
        }
    }
}

/// Outcome of checking a passphrase against the stored digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseCheck {
    NotRequired,
    Required,
    Accepted,
    Rejected,
}

impl UserConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        read_json_or_default(&data_dir.join(USER_CONFIG_FILE))
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        AtomicFileWriter::new(data_dir.to_path_buf()).write_json(USER_CONFIG_FILE, self)?;
        Ok(())
    }

    pub fn check_passphrase(&self, passphrase: Option<&Secret>) -> PassphraseCheck {
        let Some(expected) = self.passphrase_sha256.as_deref() else {
            return PassphraseCheck::NotRequired;
        };
        match passphrase {
            None => PassphraseCheck::Required,
            Some(secret) if passphrase_digest(secret).eq_ignore_ascii_case(expected.trim()) => {
                PassphraseCheck::Accepted
            }
            Some(_) => PassphraseCheck::Rejected,
        }
    }
}

pub fn passphrase_digest(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.expose().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
