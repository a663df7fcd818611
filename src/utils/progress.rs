//! Progress indicators for long-running operations

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Create a spinner for indeterminate operations
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner shown while an image is imported
pub struct ImportProgress {
    pb: ProgressBar,
}

impl ImportProgress {
    /// A hidden bar when progress output is disabled
    pub fn new(image: &str, enabled: bool) -> Self {
        let message = format!("Importing {} into the in-cluster registry", image);
        let pb = if enabled {
            create_spinner(&message)
        } else {
            ProgressBar::hidden()
        };
        Self { pb }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
