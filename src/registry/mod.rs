//! In-cluster registry: image import and registry configuration

pub mod auth;
pub mod config;
pub mod import;
pub mod push;
pub mod reference;
pub mod tunnel;

pub use auth::{AuthError, Authenticator, Credentials, DockerConfigAuthenticator, StaticAuthenticator};
pub use config::RegistryConfig;
pub use import::{ImportError, ImportErrorKind, ImportOptions, ImportStage, Importer};
pub use push::PushResult;
pub use reference::ImageReference;
pub use tunnel::{PodTarget, PortForwardOpener, Tunnel, TunnelGuard, TunnelOpener};
