//! User prompt utilities for interactive confirmation

use anyhow::Result;
use dialoguer::Confirm;

/// Ask user for yes/no confirmation
pub fn confirm(prompt: &str) -> Result<bool> {
    let result = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(result)
}

/// Ask before replacing an existing file
///
/// Skips the prompt when the file is new or the user opted out of confirmations.
pub fn confirm_overwrite(path: &std::path::Path, ask: bool) -> Result<bool> {
    if !ask || !path.exists() {
        return Ok(true);
    }

    confirm(&format!("{} already exists. Overwrite?", path.display()))
}
