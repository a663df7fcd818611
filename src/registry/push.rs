//! Registry push protocol over a tunnel endpoint
//!
//! The source image is exported from the local container runtime, then its
//! config and layer blobs followed by a manifest are uploaded with
//! `oci-distribution`.

use crate::registry::auth::Credentials;
use crate::registry::reference::ImageReference;
use crate::utils::ContainerRuntime;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{
    IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_SYMLINK_HOPS: usize = 8;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("failed to export image '{image}': {message}")]
    Export { image: String, message: String },

    #[error("invalid image archive: {0}")]
    Archive(String),

    #[error("{0}")]
    Registry(String),
}

/// Outcome of a successful push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Manifest digest reported by the registry
    pub digest: String,
    /// Bytes uploaded (config and layers)
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// A locally resolved image, ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub config: Vec<u8>,
    pub layers: Vec<LayerBlob>,
}

impl SourceImage {
    pub fn size(&self) -> u64 {
        let layers: usize = self.layers.iter().map(|layer| layer.data.len()).sum();
        (self.config.len() + layers) as u64
    }
}

/// Resolves the content of a local image
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn resolve(&self, reference: &ImageReference) -> Result<SourceImage, PushError>;
}

pub struct PushRequest<'a> {
    pub reference: &'a ImageReference,
    /// Stream endpoint of the registry, usually a tunnel
    pub endpoint: SocketAddr,
    pub credentials: &'a Credentials,
}

/// Uploads an image to a registry endpoint
#[async_trait]
pub trait ImagePusher: Send + Sync {
    async fn push(&self, request: PushRequest<'_>) -> Result<PushResult, PushError>;
}

/// Reads images from the local docker/podman daemon
#[derive(Debug, Clone, Copy)]
pub struct DaemonImageSource {
    runtime: ContainerRuntime,
}

impl DaemonImageSource {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ImageSource for DaemonImageSource {
    async fn resolve(&self, reference: &ImageReference) -> Result<SourceImage, PushError> {
        let image = reference.to_string();
        let export_error = |message: String| PushError::Export {
            image: image.clone(),
            message,
        };

        // removed on drop, including when the import is cancelled mid-export
        let archive = tempfile::Builder::new()
            .prefix("kyma-image-")
            .suffix(".tar")
            .tempfile()
            .map_err(|e| export_error(e.to_string()))?;

        self.runtime
            .save(&image, archive.path())
            .await
            .map_err(|e| export_error(format!("{:#}", e)))?;

        let bytes = tokio::fs::read(archive.path())
            .await
            .map_err(|e| export_error(e.to_string()))?;
        drop(archive);

        tokio::task::spawn_blocking(move || read_archive(bytes.as_slice(), &image))
            .await
            .map_err(|e| PushError::Archive(e.to_string()))?
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

enum ArchiveEntry {
    File(Vec<u8>),
    Symlink(PathBuf),
}

/// Read a `docker save` / `podman save` archive
///
/// When the archive holds several images, the one tagged `image` wins.
pub fn read_archive<R: Read>(reader: R, image: &str) -> Result<SourceImage, PushError> {
    let entries = collect_entries(reader)?;

    let manifest = lookup(&entries, Path::new("manifest.json"))
        .ok_or_else(|| PushError::Archive("manifest.json not found".to_string()))?;
    let manifests: Vec<ArchiveManifest> = serde_json::from_slice(manifest)
        .map_err(|e| PushError::Archive(format!("malformed manifest.json: {}", e)))?;

    let selected = manifests
        .iter()
        .find(|m| {
            m.repo_tags
                .iter()
                .flatten()
                .any(|tag| tag == image || tag.ends_with(&format!("/{}", image)))
        })
        .or_else(|| manifests.first())
        .ok_or_else(|| PushError::Archive("manifest.json lists no images".to_string()))?;

    let config = read_blob(&entries, &selected.config)?.to_vec();

    let layers = selected
        .layers
        .iter()
        .map(|path| {
            let data = read_blob(&entries, path)?.to_vec();
            let media_type = if data.starts_with(&GZIP_MAGIC) {
                IMAGE_LAYER_GZIP_MEDIA_TYPE
            } else {
                IMAGE_LAYER_MEDIA_TYPE
            };
            Ok(LayerBlob {
                data,
                media_type: media_type.to_string(),
            })
        })
        .collect::<Result<Vec<_>, PushError>>()?;

    Ok(SourceImage { config, layers })
}

fn collect_entries<R: Read>(reader: R) -> Result<HashMap<PathBuf, ArchiveEntry>, PushError> {
    let archive_error = |e: std::io::Error| PushError::Archive(e.to_string());

    let mut archive = tar::Archive::new(reader);
    let mut entries = HashMap::new();

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let path = normalize(&entry.path().map_err(archive_error)?);

        let kind = entry.header().entry_type();
        if kind.is_symlink() {
            if let Some(target) = entry.link_name().map_err(archive_error)? {
                let base = path.parent().unwrap_or(Path::new(""));
                let resolved = normalize(&base.join(target));
                entries.insert(path, ArchiveEntry::Symlink(resolved));
            }
        } else if kind.is_file() {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(archive_error)?;
            entries.insert(path, ArchiveEntry::File(data));
        }
    }

    Ok(entries)
}

fn read_blob<'a>(entries: &'a HashMap<PathBuf, ArchiveEntry>, path: &str) -> Result<&'a [u8], PushError> {
    lookup(entries, &normalize(Path::new(path)))
        .ok_or_else(|| PushError::Archive(format!("{} not found", path)))
}

fn lookup<'a>(entries: &'a HashMap<PathBuf, ArchiveEntry>, path: &Path) -> Option<&'a [u8]> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        match entries.get(&current)? {
            ArchiveEntry::File(data) => return Some(data),
            ArchiveEntry::Symlink(target) => current = target.clone(),
        }
    }
    None
}

/// Lexically resolve `.` and `..` so symlink targets match entry paths
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Pushes with `oci-distribution` over plain HTTP
///
/// A fresh client is built per push, so nothing is shared between imports.
pub struct OciPusher {
    source: Arc<dyn ImageSource>,
}

impl OciPusher {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ImagePusher for OciPusher {
    async fn push(&self, request: PushRequest<'_>) -> Result<PushResult, PushError> {
        let image = self.source.resolve(request.reference).await?;
        let size = image.size();

        let target = Reference::with_tag(
            request.endpoint.to_string(),
            request.reference.repository().to_string(),
            request.reference.tag().to_string(),
        );
        let auth = registry_auth(request.credentials);

        tracing::info!(
            reference = %request.reference,
            endpoint = %request.endpoint,
            layers = image.layers.len(),
            size,
            "Pushing image"
        );

        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Http,
            ..Default::default()
        });

        let layers: Vec<ImageLayer> = image
            .layers
            .into_iter()
            .map(|layer| ImageLayer::new(layer.data, layer.media_type, None))
            .collect();
        let config = Config::new(image.config, IMAGE_CONFIG_MEDIA_TYPE.to_string(), None);

        let response = client
            .push(&target, &layers, config, &auth, None)
            .await
            .map_err(|e| PushError::Registry(e.to_string()))?;

        tracing::debug!(manifest_url = %response.manifest_url, "Manifest uploaded");

        let digest = client
            .fetch_manifest_digest(&target, &auth)
            .await
            .map_err(|e| PushError::Registry(e.to_string()))?;

        Ok(PushResult { digest, size })
    }
}

fn registry_auth(credentials: &Credentials) -> RegistryAuth {
    match credentials {
        Credentials::Anonymous => RegistryAuth::Anonymous,
        Credentials::Basic { username, password } => {
            RegistryAuth::Basic(username.clone(), password.clone())
        }
        // docker convention: identity tokens travel as the password of the `<token>` user
        Credentials::Bearer(token) => RegistryAuth::Basic("<token>".to_string(), token.clone()),
    }
}
