//! User-facing errors with actionable suggestions

use crate::registry::{ImportError, ImportErrorKind};
use colored::Colorize;
use thiserror::Error;

const REGISTRY_DOCS: &str = "https://kyma-project.io/#/docker-registry/user/README";

/// Error with suggestions and documentation links
///
/// `message` is printed verbatim, so wrapped error texts keep their exact form.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct CliError {
    pub message: String,
    pub suggestions: Vec<String>,
    pub docs_link: Option<String>,
}

impl CliError {
    /// Create a new error with suggestions
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestions: Vec::new(),
            docs_link: None,
        }
    }

    /// Add a suggestion to the error
    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add a documentation link
    pub fn with_docs(mut self, link: impl Into<String>) -> Self {
        self.docs_link = Some(link.into());
        self
    }

    /// Print the error and its suggestions to stderr
    pub fn display(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self.message);

        if !self.suggestions.is_empty() {
            eprintln!();
            eprintln!("{}", "Suggestions:".yellow().bold());
            for suggestion in &self.suggestions {
                eprintln!("  {} {}", "→".blue(), suggestion);
            }
        }

        if let Some(docs) = &self.docs_link {
            eprintln!();
            eprintln!("{} {}", "Documentation:".cyan(), docs);
        }
    }

    /// Failed image import, keeping the import error text as is
    pub fn import_failed(err: &ImportError) -> Self {
        let error = Self::new(err.to_string());
        match err.kind() {
            ImportErrorKind::InvalidReferenceFormat => error
                .suggest("Pass the image as <name>:<tag>, for example: my-app:v1")
                .suggest("Registry hosts and digests are not accepted in the image name"),
            ImportErrorKind::TunnelEstablishFailed => error
                .suggest("Check that the registry pod is running: kubectl get pods -n kyma-system")
                .suggest("Verify your kubeconfig points at the right cluster")
                .suggest("Override the target with --pod-name, --pod-namespace and --pod-port"),
            ImportErrorKind::AuthorizationFailed => error
                .suggest("Check the registry credentials secret: kyma registry config --dockerconfig")
                .suggest("Pass credentials explicitly with --username and --password"),
            ImportErrorKind::TunnelBroken => error
                .suggest("The connection to the registry pod dropped; run the import again")
                .suggest("Run with -vv to see tunnel diagnostics"),
            ImportErrorKind::Push => error
                .suggest("Verify the image exists locally: docker image inspect <image>")
                .suggest("Run with -vv to see registry responses"),
            ImportErrorKind::Cancelled => error,
        }
    }

    /// Registry configuration could not be read from the cluster
    pub fn registry_config_unavailable(reason: &str) -> Self {
        Self::new(format!(
            "failed to load in-cluster registry configuration: {}",
            reason
        ))
        .suggest("Check that the docker-registry module is installed in the cluster")
        .suggest("Adjust [registry] in .kyma.toml if the registry uses a custom namespace or secret")
        .with_docs(REGISTRY_DOCS)
    }

    /// Cluster rejected the request
    pub fn permission_denied(operation: &str) -> Self {
        Self::new(format!("Permission denied: {}", operation))
            .suggest("Verify you have sufficient cluster permissions")
            .suggest("Check that your kubeconfig credentials have not expired")
    }
}

/// Helper to display error and exit
pub fn display_error_and_exit(error: CliError) -> ! {
    error.display();
    std::process::exit(1);
}

/// Convert anyhow error to CliError when possible
pub fn enhance_error(err: anyhow::Error) -> CliError {
    let err = match err.downcast::<CliError>() {
        Ok(cli) => return cli,
        Err(err) => err,
    };

    if let Some(import) = err.downcast_ref::<ImportError>() {
        return CliError::import_failed(import);
    }

    let err_str = format!("{:#}", err);

    if err_str.contains("Unauthorized") || err_str.contains("Forbidden") {
        return CliError::permission_denied(&err_str);
    }

    CliError::new(err_str).suggest("Run with --verbose for more details")
}
