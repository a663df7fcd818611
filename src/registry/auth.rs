//! Registry credential resolution

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Credential resolution failure
///
/// Displays as the bare cause so callers can prefix it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AuthError {
    message: String,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Credentials usable by the push step
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// Resolves push credentials for a registry host
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Credentials, AuthError>;
}

/// Always hands out the same credentials
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    credentials: Credentials,
}

impl StaticAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn anonymous() -> Self {
        Self::new(Credentials::Anonymous)
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn resolve(&self, _host: &str) -> Result<Credentials, AuthError> {
        Ok(self.credentials.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
    #[serde(default)]
    registrytoken: Option<String>,
}

/// Resolves credentials from a docker `config.json` document
#[derive(Debug, Clone)]
pub struct DockerConfigAuthenticator {
    config: DockerConfigFile,
}

impl DockerConfigAuthenticator {
    /// Parse a docker config (`config.json` or a `.dockerconfigjson` secret value)
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        let config: DockerConfigFile = serde_json::from_str(json)
            .map_err(|e| AuthError::new(format!("invalid docker config: {}", e)))?;
        Ok(Self { config })
    }

    fn lookup(&self, host: &str) -> Option<&DockerAuthEntry> {
        let wanted = normalize_host(host);
        self.config
            .auths
            .iter()
            .find(|(key, _)| normalize_host(key) == wanted)
            .map(|(_, entry)| entry)
    }
}

#[async_trait]
impl Authenticator for DockerConfigAuthenticator {
    async fn resolve(&self, host: &str) -> Result<Credentials, AuthError> {
        let entry = self
            .lookup(host)
            .ok_or_else(|| AuthError::new(format!("no credentials found for registry '{}'", host)))?;

        if let Some(token) = entry.registrytoken.as_ref().or(entry.identitytoken.as_ref())
            && !token.is_empty()
        {
            return Ok(Credentials::Bearer(token.clone()));
        }

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Credentials::basic(username, password));
        }

        let encoded = entry
            .auth
            .as_deref()
            .ok_or_else(|| AuthError::new(format!("credentials for registry '{}' are empty", host)))?;
        decode_basic_auth(encoded)
    }
}

fn decode_basic_auth(encoded: &str) -> Result<Credentials, AuthError> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthError::new(format!("invalid auth entry: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| AuthError::new(format!("invalid auth entry: {}", e)))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| AuthError::new("invalid auth entry: expected 'username:password'"))?;

    Ok(Credentials::basic(username, password))
}

fn normalize_host(host: &str) -> &str {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.trim_end_matches('/')
}
