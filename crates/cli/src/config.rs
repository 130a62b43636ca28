use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use floorplan_core::{AliasTable, DomainFilter};
use floorplan_hass::DEFAULT_SNAPSHOT_TIMEOUT;
use floorplan_sync::SyncConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_yaml::Error },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// On-disk settings. Every key is optional; `url` and `token` must come from somewhere.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub url: String,
    pub token: String,
    /// SVG floorplan whose element ids are the render targets.
    pub floorplan: Option<PathBuf>,
    /// entity id -> element id
    pub mapping: HashMap<String, String>,
    pub domains: Vec<String>,
    pub reconnect_secs: Option<u64>,
    pub snapshot_timeout_secs: Option<u64>,
    pub queue_capacity: Option<usize>,
}

impl Config {
    pub fn from_yaml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut cfg = Self::from_yaml(path, &text)?;
        // Relative floorplan paths are resolved against the config file's directory.
        if let (Some(fp), Some(dir)) = (cfg.floorplan.as_ref(), path.parent()) {
            if fp.is_relative() {
                cfg.floorplan = Some(dir.join(fp));
            }
        }
        Ok(cfg)
    }

    /// Load `path`, tolerating a missing file when the connection settings come from flags.
    pub fn load_or_default(path: &Path, have_overrides: bool) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if have_overrides && source.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn with_overrides(mut self, url: Option<String>, token: Option<String>) -> Self {
        if let Some(url) = url {
            self.url = url;
        }
        if let Some(token) = token {
            self.token = token;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing("url"));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        Ok(())
    }

    pub fn aliases(&self) -> AliasTable { AliasTable::new(self.mapping.clone()) }

    pub fn domain_filter(&self) -> DomainFilter { DomainFilter::new(self.domains.iter().cloned()) }

    /// File values first, then `FLOORPLAN_SNAPSHOT_TIMEOUT_SECS`.
    pub fn snapshot_timeout(&self) -> Duration {
        std::env::var("FLOORPLAN_SNAPSHOT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .or(self.snapshot_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT)
    }

    /// Defaults, then file values, then the `FLOORPLAN_*` env knobs.
    pub fn sync_config(&self) -> SyncConfig {
        let mut cfg = SyncConfig::default();
        if let Some(secs) = self.reconnect_secs {
            cfg = cfg.with_reconnect_delay(Duration::from_secs(secs));
        }
        if let Some(cap) = self.queue_capacity {
            cfg = cfg.with_queue_capacity(cap);
        }
        cfg.apply_env()
    }
}
