//! In-cluster registry configuration
//!
//! The registry module publishes its endpoints and push credentials in a
//! secret next to the registry pod.

use crate::config::settings::RegistrySettings;
use crate::registry::auth::{
    AuthError, Authenticator, Credentials, DockerConfigAuthenticator, StaticAuthenticator,
};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const PULL_ADDRESS_KEY: &str = "pullRegAddr";
const PUSH_ADDRESS_KEY: &str = "pushRegAddr";

#[derive(Error, Debug)]
pub enum RegistryConfigError {
    #[error("failed to get secret {namespace}/{name}: {source}")]
    Secret {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("secret {namespace}/{name} has no '{key}' entry")]
    MissingKey {
        namespace: String,
        name: String,
        key: &'static str,
    },

    #[error("failed to list registry pods in {namespace}: {source}")]
    PodList {
        namespace: String,
        #[source]
        source: kube::Error,
    },

    #[error("no registry pod matching '{selector}' found in {namespace}")]
    NoPod { namespace: String, selector: String },
}

/// Decoded registry secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    pub docker_config_json: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pull_reg_addr: Option<String>,
    pub push_reg_addr: Option<String>,
}

impl SecretData {
    fn from_secret(
        data: &BTreeMap<String, k8s_openapi::ByteString>,
        namespace: &str,
        name: &str,
    ) -> Result<Self, RegistryConfigError> {
        let text = |key: &str| {
            data.get(key)
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .filter(|value| !value.is_empty())
        };

        let docker_config_json =
            text(DOCKER_CONFIG_KEY).ok_or_else(|| RegistryConfigError::MissingKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
                key: DOCKER_CONFIG_KEY,
            })?;

        Ok(Self {
            docker_config_json,
            username: text(USERNAME_KEY),
            password: text(PASSWORD_KEY),
            pull_reg_addr: text(PULL_ADDRESS_KEY),
            push_reg_addr: text(PUSH_ADDRESS_KEY),
        })
    }
}

/// Registry pod coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPod {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub secret_name: String,
    pub secret_data: SecretData,
    pub pod: Option<RegistryPod>,
}

impl RegistryConfig {
    /// Read the registry secret and find the registry pod
    ///
    /// A missing pod is not an error here: `registry config` only needs the secret.
    pub async fn load(
        client: Client,
        settings: &RegistrySettings,
    ) -> Result<Self, RegistryConfigError> {
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &settings.namespace);
        let secret = secrets
            .get(&settings.secret_name)
            .await
            .map_err(|source| RegistryConfigError::Secret {
                namespace: settings.namespace.clone(),
                name: settings.secret_name.clone(),
                source,
            })?;

        let secret_data = SecretData::from_secret(
            &secret.data.unwrap_or_default(),
            &settings.namespace,
            &settings.secret_name,
        )?;

        let pods: Api<Pod> = Api::namespaced(client, &settings.namespace);
        let list = pods
            .list(&ListParams::default().labels(&settings.pod_selector))
            .await
            .map_err(|source| RegistryConfigError::PodList {
                namespace: settings.namespace.clone(),
                source,
            })?;

        let pod = select_pod(&list.items).map(|name| RegistryPod {
            name,
            namespace: settings.namespace.clone(),
        });

        tracing::debug!(
            secret = %settings.secret_name,
            pod = ?pod,
            pull = ?secret_data.pull_reg_addr,
            "Loaded registry configuration"
        );

        Ok(Self {
            secret_name: settings.secret_name.clone(),
            secret_data,
            pod,
        })
    }

    /// The registry pod, or an error naming what was searched for
    pub fn require_pod(&self, settings: &RegistrySettings) -> Result<&RegistryPod, RegistryConfigError> {
        self.pod.as_ref().ok_or_else(|| RegistryConfigError::NoPod {
            namespace: settings.namespace.clone(),
            selector: settings.pod_selector.clone(),
        })
    }

    /// Push credentials published by the registry
    ///
    /// The secret's own `username`/`password` win; the docker config is only
    /// consulted when they are absent.
    pub fn authenticator(&self) -> Result<Arc<dyn Authenticator>, AuthError> {
        match (&self.secret_data.username, &self.secret_data.password) {
            (Some(username), Some(password)) => Ok(Arc::new(StaticAuthenticator::new(
                Credentials::basic(username, password),
            ))),
            _ => Ok(Arc::new(DockerConfigAuthenticator::from_json(
                &self.secret_data.docker_config_json,
            )?)),
        }
    }
}

/// Prefer a running pod, fall back to the first one listed
fn select_pod(pods: &[Pod]) -> Option<String> {
    let is_running = |pod: &&Pod| {
        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running")
    };

    pods.iter()
        .find(is_running)
        .or_else(|| pods.first())
        .and_then(|pod| pod.metadata.name.clone())
}
