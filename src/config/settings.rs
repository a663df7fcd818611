//! Configuration file support for kyma

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub behavior: Behavior,
}

/// Where the in-cluster registry lives
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    #[serde(default = "default_registry_namespace")]
    pub namespace: String,

    /// Secret holding the registry addresses and push credentials
    #[serde(default = "default_secret_name")]
    pub secret_name: String,

    /// Label selector matching the registry pod
    #[serde(default = "default_pod_selector")]
    pub pod_selector: String,

    #[serde(default = "default_pod_port")]
    pub pod_port: String,
}

/// Behavior settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Behavior {
    #[serde(default = "default_true")]
    pub confirm_destructive: bool,

    #[serde(default = "default_true")]
    pub show_progress: bool,
}

// Default value functions
fn default_registry_namespace() -> String {
    "kyma-system".to_string()
}

fn default_secret_name() -> String {
    "dockerregistry-config".to_string()
}

fn default_pod_selector() -> String {
    "app=docker-registry".to_string()
}

fn default_pod_port() -> String {
    "5000".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            namespace: default_registry_namespace(),
            secret_name: default_secret_name(),
            pod_selector: default_pod_selector(),
            pod_port: default_pod_port(),
        }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            confirm_destructive: default_true(),
            show_progress: default_true(),
        }
    }
}

impl Settings {
    /// Load settings from file or return defaults
    pub fn load() -> Self {
        let Some(path) = Self::find_config_file() else {
            return Self::default();
        };

        match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                crate::log_warn!("Ignoring config file: {:#}", e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Find config file in standard locations
    /// Priority:
    /// 1. .kyma.toml in current directory
    /// 2. ~/.config/kyma/config.toml (XDG config directory)
    fn find_config_file() -> Option<PathBuf> {
        let local_config = PathBuf::from(".kyma.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("kyma").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        None
    }
}
