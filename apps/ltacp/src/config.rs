//! Application configuration.
//!
//! Stored as TOML at `~/.config/ltacp/ltacp.toml` unless `--config` names
//! another file. A missing default file means built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use ltacp_storage::{StorageCommands, UrlMapping};
use ltacp_transfer::TransferConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transfer: TransferConfig,

    /// SURL prefixes and the TURL prefixes replacing them.
    pub url_table: Vec<UrlMapping>,

    /// URL schemes the upload client understands as given.
    pub passthrough_schemes: Vec<String>,

    pub storage: StorageCommands,
}

impl AppConfig {
    /// Loads `explicit`, or the default file when it exists.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = config_path();
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                    return Ok(Self::default());
                }
                path
            }
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("ltacp")
        .join("ltacp.toml")
}
