use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use batchrelay::errors::{BatchrelayError, Result};
use batchrelay::exec::{BodyFuture, JobBody, JobContext};

type Script = dyn Fn(&JobContext<'_>) -> Result<()> + Send + Sync;

/// A job body driven by a closure.
///
/// - counts how many times it was started and how many times it finished
/// - optionally sleeps before running the closure (a slow or hanging job)
/// - clones share the counters, so a test can keep one and hand the other
///   to a runner.
#[derive(Clone)]
pub struct ScriptedJob {
    script: Arc<Script>,
    delay: Duration,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl ScriptedJob {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&JobContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            delay: Duration::ZERO,
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Succeeds without touching anything.
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        let reason = reason.to_string();
        Self::new(move |ctx| {
            Err(BatchrelayError::JobFailure {
                node: ctx.env.node().to_string(),
                reason: reason.clone(),
            })
        })
    }

    /// Never finishes within any test's patience.
    pub fn hanging() -> Self {
        Self::succeeding().with_delay(Duration::from_secs(3600))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn into_body(self) -> Arc<dyn JobBody> {
        Arc::new(self)
    }
}

impl JobBody for ScriptedJob {
    fn execute<'a>(&'a self, ctx: JobContext<'a>) -> BodyFuture<'a> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = (self.script)(&ctx);
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        })
    }
}
