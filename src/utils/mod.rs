//! Utility modules for kyma

pub mod container;
pub mod errors;
pub mod logger;
pub mod progress;
pub mod prompt;

// Re-export commonly used items
pub use container::ContainerRuntime;
pub use errors::{CliError, display_error_and_exit};
pub use logger::{log_info, log_warn};
pub use prompt::confirm;
