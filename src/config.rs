//! Settings: defaults, then `config.yaml`, then `STOKE_*` environment.
//!
//! All on-disk state lives under a single root directory unless a setting
//! points elsewhere.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directories scanned for cluster type definitions (`<path>/<type>/metadata.yaml`).
    pub type_paths: Vec<PathBuf>,
    /// Saved answers, one YAML file per cluster type id.
    pub answers_dir: PathBuf,
    /// Node registry and selected cluster type.
    pub data_dir: PathBuf,
    /// Job logs and their user-facing symlinks.
    pub log_dir: PathBuf,
    pub inventory_dir: PathBuf,
    /// Exported to jobs as `ANSIBLE_CALLBACK_PLUGINS`.
    pub ansible_callback_dir: PathBuf,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub hunter: HunterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HunterSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Drop hunter entries after a successful removal.
    #[serde(default)]
    pub remove_entry: bool,
    #[serde(default = "default_hunter_command")]
    pub command: String,
}

impl Default for HunterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            remove_entry: false,
            command: default_hunter_command(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_hunter_command() -> String {
    "hunter".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("stoke");
        Self::rooted(&root)
    }
}

impl Settings {
    /// Settings with every directory placed under `root`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            type_paths: vec![root.join("types")],
            answers_dir: root.join("answers"),
            data_dir: root.join("data"),
            log_dir: root.join("log"),
            inventory_dir: root.join("inventory"),
            ansible_callback_dir: root.join("callback"),
            probe_timeout_secs: default_probe_timeout(),
            log_level: default_log_level(),
            hunter: HunterSettings::default(),
        }
    }

    /// Default config file: `~/.config/stoke/config.yaml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("stoke")
            .join("config.yaml")
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn nodes_file(&self) -> PathBuf {
        self.data_dir.join("nodes.yaml")
    }

    pub fn selection_file(&self) -> PathBuf {
        self.data_dir.join("selection.yaml")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
}

/// Load settings from the given file (or the default path) layered over the
/// built-in defaults, with `STOKE_` environment variables on top.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Settings::default_path);
    let settings = figment(&path).extract()?;
    Ok(settings)
}

fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(Settings::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("STOKE_").split("__"))
}
