// src/exec/body.rs

//! Job bodies: the opaque work a node performs once per activation.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

use super::shell::shell_command;
use super::sink::LogSink;
use crate::config::NodeEnvironment;
use crate::errors::{BatchrelayError, Result};
use crate::store::ArtifactStore;

pub type BodyFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Everything a job body may touch during one activation.
pub struct JobContext<'a> {
    pub env: &'a NodeEnvironment,
    pub store: &'a dyn ArtifactStore,
    pub sink: &'a LogSink,
    pub work_dir: &'a Path,
}

/// The work run by a [`JobRunner`](super::JobRunner).
///
/// Implementations must finish every artifact write before returning `Ok`;
/// the completion event is published only afterwards and is the sole
/// readiness signal for the next stage.
pub trait JobBody: Send + Sync {
    fn execute<'a>(&'a self, ctx: JobContext<'a>) -> BodyFuture<'a>;
}

/// Runs a shell command in the work directory with the node environment.
#[derive(Debug, Clone)]
pub struct ShellJob {
    cmd: String,
}

impl ShellJob {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }
}

impl JobBody for ShellJob {
    fn execute<'a>(&'a self, ctx: JobContext<'a>) -> BodyFuture<'a> {
        Box::pin(async move {
            let node = ctx.env.node().to_string();
            info!(
                node = %node,
                stage = %ctx.env.stage(),
                cmd = %self.cmd,
                "starting job process"
            );

            let mut child = shell_command(&self.cmd)
                .current_dir(ctx.work_dir)
                .envs(ctx.env.vars())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("spawning job process for node '{node}'"))?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            // Both streams must be drained or the child can block on a full pipe.
            tokio::join!(
                copy_lines(stdout, ctx.sink, ""),
                copy_lines(stderr, ctx.sink, "stderr: ")
            );

            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for job process on node '{node}'"))?;

            let code = status.code().unwrap_or(-1);
            info!(node = %node, exit_code = code, success = status.success(), "job process exited");

            if status.success() {
                Ok(())
            } else {
                Err(BatchrelayError::JobFailure {
                    node,
                    reason: format!("exit code {code}"),
                })
            }
        })
    }
}

/// Forward a child stream to the sink line by line until EOF.
///
/// Lines are decoded lossily; job output is not guaranteed to be UTF-8. The
/// stream is read to the end even after a read error so the child never sees
/// a closed pipe.
async fn copy_lines<R>(stream: Option<R>, sink: &LogSink, prefix: &str)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Err(e) = sink.append(&format!("{prefix}{line}")) {
                    warn!(error = %e, "failed to append job output to log sink");
                }
            }
            Err(e) => {
                warn!(error = %e, "error reading job output; draining the rest");
                if tokio::io::copy(&mut reader, &mut tokio::io::sink()).await.is_err() {
                    break;
                }
            }
        }
    }
}
