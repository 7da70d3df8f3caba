pub mod builders;
pub mod fake_node;
pub mod scripted_job;

use std::sync::{Arc, Once};
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use batchrelay::bus::InMemoryBus;
use batchrelay::config::{ConfigFile, NodeProfile};
use batchrelay::exec::{JobBody, JobRunner, JobSpec, LogSink};
use batchrelay::guard::ExecutionGuard;
use batchrelay::node::{LocalNodeBackend, NodeTable};
use batchrelay::store::ArtifactStore;
use batchrelay::types::StageId;

pub use builders::{ConfigFileBuilder, StageConfigBuilder};
pub use fake_node::{FakeCall, FakeNodeBackend};
pub use scripted_job::ScriptedJob;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Poll `condition` every 10ms until it holds; panics after 5 seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    with_timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// In-process nodes for both stages, publishing on `bus`, with in-memory
/// log sinks.
pub fn local_backend(
    cfg: &ConfigFile,
    table: NodeTable,
    bus: &InMemoryBus,
    store: Arc<dyn ArtifactStore>,
    guard: Arc<dyn ExecutionGuard>,
    collect: Arc<dyn JobBody>,
    process: Arc<dyn JobBody>,
) -> LocalNodeBackend {
    let runner = |stage: StageId, body: Arc<dyn JobBody>| {
        JobRunner::new(
            JobSpec::from_config(cfg, stage),
            Arc::clone(&guard),
            Arc::clone(&store),
            Arc::new(bus.clone()),
            body,
            LogSink::memory(),
        )
    };

    LocalNodeBackend::new(table)
        .with_node(
            NodeProfile::from_config(cfg, StageId::Collect),
            runner(StageId::Collect, collect),
        )
        .with_node(
            NodeProfile::from_config(cfg, StageId::Process),
            runner(StageId::Process, process),
        )
}
