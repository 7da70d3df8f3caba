// src/exec/shell.rs

//! Shell command helpers shared by job bodies, node backends and the
//! command bus adapters.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

/// Build a shell command appropriate for the platform.
pub fn shell_command(script: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(script);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(script);
        c
    }
}

/// Substitute `{name}` placeholders in a command template.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
}

/// Run a short-lived command to completion; non-zero exit is an error
/// carrying the command's stderr.
pub async fn run_checked(script: &str, envs: &[(String, String)]) -> Result<()> {
    debug!(cmd = %script, "running command");

    let output = shell_command(script)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning command '{script}'"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "command '{}' exited with {}: {}",
            script,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}
