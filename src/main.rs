//! Kyma CLI - command-line client for Kyma clusters

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use kyma_cli::commands::registry::{ImageImportOptions, RegistryConfigOptions};
use kyma_cli::utils::{display_error_and_exit, errors::enhance_error, logger};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kyma")]
#[command(author, version, about = "Command-line client for Kyma clusters", long_about = None)]
struct Cli {
    /// Verbose output (can be used multiple times: -v, -vv, -vvv)
    /// -v: INFO, -vv: DEBUG, -vvv: TRACE
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to kubeconfig file (defaults to KUBECONFIG or ~/.kube/config)
    ///
    /// Not bound to KUBECONFIG directly: that variable may list several files.
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with the in-cluster registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Push a local image into the in-cluster registry
    #[command(name = "image-import")]
    ImageImport {
        /// Image to import, as name:tag
        image: String,

        /// Registry host the cluster pulls from (default: from the registry secret)
        #[arg(long)]
        pull_host: Option<String>,

        /// Registry pod name (default: discovered by label)
        #[arg(long)]
        pod_name: Option<String>,

        /// Registry pod namespace
        #[arg(long)]
        pod_namespace: Option<String>,

        /// Registry pod port
        #[arg(long)]
        pod_port: Option<String>,

        /// Registry username (default: from the registry secret)
        #[arg(long, requires = "password")]
        username: Option<String>,

        /// Registry password
        #[arg(long, requires = "username", env = "KYMA_REGISTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Save the in-cluster registry docker config to a file
    Config {
        /// Generate a docker config.json file for the registry
        #[arg(long)]
        dockerconfig: bool,

        /// Print the external URL of the registry
        #[arg(long)]
        externalurl: bool,

        /// Path where the output file should be saved to
        #[arg(long, default_value = "config.json")]
        output: PathBuf,

        /// Overwrite the output file without asking
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logger::init(cli.verbose);

    let result = match cli.command {
        Commands::Registry { command } => handle_registry_command(command, cli.kubeconfig).await,
        Commands::Completion { shell } => handle_completion_command(shell),
        Commands::Version => handle_version_command(),
    };

    if let Err(e) = result {
        display_error_and_exit(enhance_error(e));
    }

    Ok(())
}

async fn handle_registry_command(
    command: RegistryCommands,
    kubeconfig: Option<PathBuf>,
) -> Result<()> {
    match command {
        RegistryCommands::ImageImport {
            image,
            pull_host,
            pod_name,
            pod_namespace,
            pod_port,
            username,
            password,
        } => {
            kyma_cli::commands::registry::image_import(ImageImportOptions {
                kubeconfig,
                image,
                pull_host,
                pod_name,
                pod_namespace,
                pod_port,
                username,
                password,
            })
            .await
        }
        RegistryCommands::Config {
            dockerconfig,
            externalurl,
            output,
            force,
        } => {
            kyma_cli::commands::registry::config(RegistryConfigOptions {
                kubeconfig,
                dockerconfig,
                externalurl,
                output,
                force,
            })
            .await
        }
    }
}

fn handle_completion_command(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "kyma", &mut io::stdout());
    Ok(())
}

fn handle_version_command() -> Result<()> {
    println!("kyma {}", env!("CARGO_PKG_VERSION"));
    println!("Command-line client for Kyma clusters");
    Ok(())
}
