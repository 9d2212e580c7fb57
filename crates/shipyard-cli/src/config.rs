//! Configuration management
//!
//! `shipyard` reads a YAML file from `--config` (or `SHIPYARD_CONFIG`), else
//! `./shipyard.yaml` when present, else runs on defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shipyard_executor::{CommandTemplates, StaticSecretStore};

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "shipyard.yaml";

/// Application configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShipyardConfig {
    /// Directory holding the event log and job logs
    pub state_dir: PathBuf,
    /// Directory under which job workspaces are created
    pub workspace_root: PathBuf,
    /// Log level when `RUST_LOG` is unset
    pub log_level: String,
    /// Worker permits when a pipeline sets no limit
    pub max_concurrency: usize,
    /// Step timeout when neither the step nor the pipeline sets one
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Duration,
    /// How often a waiting gate re-reads the event log
    #[serde(with = "humantime_serde")]
    pub approval_poll_interval: Duration,
    /// Shell running every command
    pub shell: String,
    /// Repository the pipelines build, used for checkout and releases
    pub repository: PathBuf,
    /// Remote to fetch from and push tags to
    pub remote: Option<String>,
    /// Command template per external action name
    pub actions: CommandTemplates,
    /// Traffic router command; rollouts are unavailable without one
    pub router: Option<String>,
    /// Secret values, by environment then name
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ShipyardConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".shipyard"),
            workspace_root: std::env::temp_dir(),
            log_level: "info".to_string(),
            max_concurrency: 4,
            default_step_timeout: Duration::from_secs(30 * 60),
            approval_poll_interval: Duration::from_secs(2),
            shell: "sh".to_string(),
            repository: PathBuf::from("."),
            remote: None,
            actions: CommandTemplates::new(),
            router: None,
            secrets: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for ShipyardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let provisioned: Vec<_> = self
            .secrets
            .iter()
            .flat_map(|(env, names)| names.keys().map(move |name| format!("{env}/{name}")))
            .collect();
        f.debug_struct("ShipyardConfig")
            .field("state_dir", &self.state_dir)
            .field("workspace_root", &self.workspace_root)
            .field("log_level", &self.log_level)
            .field("max_concurrency", &self.max_concurrency)
            .field("default_step_timeout", &self.default_step_timeout)
            .field("approval_poll_interval", &self.approval_poll_interval)
            .field("shell", &self.shell)
            .field("repository", &self.repository)
            .field("remote", &self.remote)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("router", &self.router)
            .field("secrets", &provisioned)
            .finish()
    }
}

impl ShipyardConfig {
    /// Loads `path`, or `./shipyard.yaml`, or the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    /// Reads a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
        Self::from_yaml(&source).with_context(|| format!("Invalid configuration: {}", path.display()))
    }

    /// Parses a configuration document
    pub fn from_yaml(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(source)?;
        anyhow::ensure!(config.max_concurrency > 0, "max_concurrency must be at least 1");
        Ok(config)
    }

    /// Append-only event log location
    #[must_use]
    pub fn events_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Root of `<run_id>/<job>.log`
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Secret store provisioned from `secrets`
    #[must_use]
    pub fn secret_store(&self) -> StaticSecretStore {
        let mut store = StaticSecretStore::new();
        for (environment, values) in &self.secrets {
            for (name, value) in values {
                store.insert(environment, name, value);
            }
        }
        store
    }
}
