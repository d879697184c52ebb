//! Host integrations backed by NetworkManager and Avahi command line tools

pub mod avahi;
pub mod nmcli;

pub use avahi::AvahiPublisher;
pub use nmcli::{NmcliNetwork, NmcliWifi};

use anyhow::{Context, Result};
use tokio::process::Command;

/// Runs a tool to completion and returns its trimmed stdout.
///
/// Arguments are never logged since they may carry credentials.
async fn run(program: &str, args: &[String]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .context(format!("failed to run {program}"))?;

    anyhow::ensure!(
        output.status.success(),
        "{program} failed with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
