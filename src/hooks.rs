//! Shell hooks run around a batch and after archiving a frame.
//!
//! Commands go through `sh -c` and are awaited on the worker task. A failing
//! hook is logged and never stops the exposure.

use std::path::Path;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::{info, warn};

/// Run `command` through the shell, logging the outcome.
///
/// Returns the exit status when the command could be spawned.
pub async fn run_shell(label: &str, command: &str) -> Option<ExitStatus> {
    info!(hook = label, command, "running hook");
    match Command::new("sh").arg("-c").arg(command).status().await {
        Ok(status) if status.success() => Some(status),
        Ok(status) => {
            warn!(hook = label, command, %status, "hook exited with failure");
            Some(status)
        }
        Err(e) => {
            warn!(hook = label, command, error = %e, "hook could not be started");
            None
        }
    }
}

/// Hand a finished image to the archive script: `<script> <path>`.
pub async fn run_archive(script: &str, fits: &Path) -> Option<ExitStatus> {
    let command = format!("{} {}", script, fits.display());
    run_shell("archive", &command).await
}
