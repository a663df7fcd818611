//! `kyma registry` command implementations

use crate::config::settings::{RegistrySettings, Settings};
use crate::k8s;
use crate::registry::{
    Authenticator, Credentials, ImageReference, ImportError, ImportOptions, Importer,
    RegistryConfig, StaticAuthenticator,
};
use crate::utils::progress::ImportProgress;
use crate::utils::prompt::confirm_overwrite;
use crate::utils::{CliError, ContainerRuntime};
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Options for `kyma registry image-import`
#[derive(Debug, Clone, Default)]
pub struct ImageImportOptions {
    pub kubeconfig: Option<PathBuf>,
    pub image: String,
    pub pull_host: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub pod_port: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ImageImportOptions {
    fn explicit_credentials(&self) -> Result<Option<Credentials>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials::basic(username, password))),
            (None, None) => Ok(None),
            _ => Err(anyhow!("--username and --password must be used together")),
        }
    }

    /// Whether the registry secret and pod have to be looked up in the cluster
    fn needs_discovery(&self) -> bool {
        self.username.is_none() || self.pull_host.is_none() || self.pod_name.is_none()
    }
}

/// Registry addressing after merging flags with discovered values
#[derive(Debug, Clone, PartialEq, Eq)]
struct Addressing {
    pull_host: String,
    pod_name: String,
    pod_namespace: String,
    pod_port: String,
}

fn resolve_addressing(
    options: &ImageImportOptions,
    registry: Option<&RegistryConfig>,
    settings: &RegistrySettings,
) -> Result<Addressing> {
    let pull_host = options
        .pull_host
        .clone()
        .or_else(|| registry.and_then(|r| r.secret_data.pull_reg_addr.clone()))
        .ok_or_else(|| {
            CliError::new("registry pull host is unknown")
                .suggest("Pass it explicitly with --pull-host")
        })?;

    let (pod_name, pod_namespace) = match &options.pod_name {
        Some(name) => (
            name.clone(),
            options
                .pod_namespace
                .clone()
                .unwrap_or_else(|| settings.namespace.clone()),
        ),
        None => {
            let registry = registry.ok_or_else(|| anyhow!("registry pod is unknown"))?;
            let pod = registry
                .require_pod(settings)
                .map_err(|e| CliError::new(e.to_string()).suggest("Pass it explicitly with --pod-name"))?;
            (
                pod.name.clone(),
                options
                    .pod_namespace
                    .clone()
                    .unwrap_or_else(|| pod.namespace.clone()),
            )
        }
    };

    let pod_port = options
        .pod_port
        .clone()
        .unwrap_or_else(|| settings.pod_port.clone());

    Ok(Addressing {
        pull_host,
        pod_name,
        pod_namespace,
        pod_port,
    })
}

/// Push a local image into the in-cluster registry
pub async fn image_import(options: ImageImportOptions) -> Result<()> {
    // reject malformed references before touching the cluster
    ImageReference::parse(&options.image).map_err(ImportError::from)?;
    let explicit_credentials = options.explicit_credentials()?;

    let settings = Settings::load();
    let cluster = k8s::client::load_config(options.kubeconfig.as_deref()).await?;

    let registry = if options.needs_discovery() {
        let client = k8s::client::client(&cluster)?;
        let registry = RegistryConfig::load(client, &settings.registry)
            .await
            .map_err(|e| CliError::registry_config_unavailable(&e.to_string()))?;
        Some(registry)
    } else {
        None
    };

    let addressing = resolve_addressing(&options, registry.as_ref(), &settings.registry)?;

    let registry_auth: Arc<dyn Authenticator> = match (explicit_credentials, &registry) {
        (Some(credentials), _) => Arc::new(StaticAuthenticator::new(credentials)),
        (None, Some(registry)) => registry
            .authenticator()
            .map_err(|e| CliError::registry_config_unavailable(&e.to_string()))?,
        (None, None) => Arc::new(StaticAuthenticator::anonymous()),
    };

    crate::log_info!(
        "Importing {} via pod {}/{}:{}",
        options.image,
        addressing.pod_namespace,
        addressing.pod_name,
        addressing.pod_port
    );

    let import_options = ImportOptions {
        cluster,
        registry_auth,
        pull_host: addressing.pull_host.clone(),
        pod_name: addressing.pod_name,
        pod_namespace: addressing.pod_namespace,
        pod_port: addressing.pod_port,
    };

    let runtime = ContainerRuntime::detect()?;
    let importer = Importer::in_cluster(runtime);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let progress = ImportProgress::new(&options.image, settings.behavior.show_progress);
    let result = importer.import(&cancel, &options.image, &import_options).await;
    progress.finish();

    let pushed = result?;
    println!(
        "Image {}/{} pushed ({})",
        addressing.pull_host, options.image, pushed.digest
    );
    Ok(())
}

/// Options for `kyma registry config`
#[derive(Debug, Clone)]
pub struct RegistryConfigOptions {
    pub kubeconfig: Option<PathBuf>,
    pub dockerconfig: bool,
    pub externalurl: bool,
    pub output: PathBuf,
    pub force: bool,
}

/// Save the registry docker config and/or print its external address
pub async fn config(options: RegistryConfigOptions) -> Result<()> {
    if !options.dockerconfig && !options.externalurl {
        crate::log_warn!("Nothing to do: pass --dockerconfig and/or --externalurl");
        return Ok(());
    }

    let settings = Settings::load();
    let cluster = k8s::client::load_config(options.kubeconfig.as_deref()).await?;
    let client = k8s::client::client(&cluster)?;

    let registry = RegistryConfig::load(client, &settings.registry)
        .await
        .map_err(|e| CliError::registry_config_unavailable(&e.to_string()))?;

    if options.dockerconfig {
        let ask = settings.behavior.confirm_destructive && !options.force;
        if !confirm_overwrite(&options.output, ask)? {
            crate::log_warn!("Keeping existing {}", options.output.display());
        } else {
            std::fs::write(&options.output, &registry.secret_data.docker_config_json)
                .with_context(|| {
                    format!(
                        "failed to write docker config to file {}",
                        options.output.display()
                    )
                })?;
            println!("Docker config saved to {}", options.output.display());
        }
    }

    if options.externalurl {
        let address = registry.secret_data.push_reg_addr.as_deref().ok_or_else(|| {
            CliError::new(format!(
                "secret {} has no external registry address",
                registry.secret_name
            ))
            .suggest("Enable external access in the docker-registry module configuration")
        })?;
        println!("{}", address);
    }

    Ok(())
}
