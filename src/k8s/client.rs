//! Cluster access configuration

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;

/// Load cluster access configuration
///
/// An explicit kubeconfig path wins; otherwise the standard inference chain
/// applies (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig: {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("Failed to load kubeconfig: {}", path.display()))
        }
        None => Config::infer()
            .await
            .context("Failed to infer cluster configuration"),
    }
}

/// Build an API client for the given configuration
pub fn client(config: &Config) -> Result<Client> {
    Client::try_from(config.clone()).context("Failed to create Kubernetes client")
}
