// src/bus/command.rs

//! Bridges to an external message bus through shell commands.
//!
//! Publishing runs `publish_cmd` once per event with `{topic}` substituted and
//! the JSON payload in `BATCHRELAY_EVENT`. Receiving runs `subscribe_cmd` as a
//! long-lived process that prints one JSON event per line on stdout; each line
//! is re-published on the local in-memory bus.

use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Event, EventPublisher, InMemoryBus, PublishFuture};
use crate::errors::Result;
use crate::exec::shell::{render_template, run_checked, shell_command};

/// Environment variable carrying the JSON event for `publish_cmd`.
pub const EVENT_ENV: &str = "BATCHRELAY_EVENT";

/// Publishes by running a command template once per event.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    template: String,
}

impl CommandPublisher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl EventPublisher for CommandPublisher {
    fn publish(&self, event: Event) -> PublishFuture<'_> {
        Box::pin(async move {
            let payload = event.to_json()?;
            let script = render_template(&self.template, &[("topic", &event.topic)]);
            run_checked(&script, &[(EVENT_ENV.to_string(), payload)])
                .await
                .with_context(|| {
                    format!(
                        "publishing '{}' event to topic '{}'",
                        event.status, event.topic
                    )
                })?;
            debug!(topic = %event.topic, correlation_id = %event.correlation_id, "event handed to publish_cmd");
            Ok(())
        })
    }
}

/// Spawn `subscribe_cmd` and forward every event line it prints onto `bus`.
///
/// Lines that are not valid events are logged and skipped. The task ends when
/// the command exits or closes stdout.
pub fn spawn_event_source(cmd: String, bus: InMemoryBus) -> Result<JoinHandle<()>> {
    let mut child = shell_command(&cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning subscribe command '{cmd}'"))?;

    let stdout = child
        .stdout
        .take()
        .context("subscribe command has no stdout")?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("subscribe_cmd stderr: {}", line);
            }
        });
    }

    info!(cmd = %cmd, "event source started");

    Ok(tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match Event::from_json(line) {
                        Ok(event) => {
                            bus.publish_now(event);
                        }
                        Err(e) => warn!(error = %e, line, "skipping malformed event line"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "reading subscribe command output failed");
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) => warn!(code = status.code().unwrap_or(-1), "event source exited"),
            Err(e) => warn!(error = %e, "event source exited"),
        }
    }))
}
