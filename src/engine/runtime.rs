// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventPublisher;
use crate::errors::Result;
use crate::node::NodeBackend;
use crate::types::{CorrelationId, StageId};

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent};

/// Drives the pipeline state in response to `RuntimeEvent`s and carries out
/// the commands the core returns.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels, running watchdog timers, stopping nodes, publishing.
pub struct Runtime {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    event_tx: mpsc::Sender<RuntimeEvent>,
    backend: Arc<dyn NodeBackend>,
    publisher: Arc<dyn EventPublisher>,
    watchdogs: HashMap<(CorrelationId, StageId), JoinHandle<()>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("watchdogs", &self.watchdogs.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// `event_tx` must feed `event_rx`; watchdog timers report through it.
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: mpsc::Sender<RuntimeEvent>,
        backend: Arc<dyn NodeBackend>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx,
            backend,
            publisher,
            watchdogs: HashMap::new(),
        }
    }

    /// Main event loop. Returns the core so callers can inspect the runs.
    pub async fn run(mut self) -> Result<CoreRuntime> {
        info!("batchrelay runtime started");

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            let step = self.core.step(event);

            for command in step.commands {
                self.execute_command(command).await;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        for (_, handle) in self.watchdogs.drain() {
            handle.abort();
        }
        info!("runtime exiting");
        Ok(self.core)
    }

    async fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::ArmWatchdog {
                correlation_id,
                stage,
                after,
            } => {
                debug!(correlation_id = %correlation_id, stage = %stage, ?after, "arming watchdog");
                let tx = self.event_tx.clone();
                let cid = correlation_id.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx
                        .send(RuntimeEvent::WatchdogExpired {
                            correlation_id: cid,
                            stage,
                        })
                        .await;
                });
                if let Some(old) = self.watchdogs.insert((correlation_id, stage), handle) {
                    old.abort();
                }
            }
            CoreCommand::DisarmWatchdog {
                correlation_id,
                stage,
            } => {
                debug!(correlation_id = %correlation_id, stage = %stage, "disarming watchdog");
                if let Some(handle) = self.watchdogs.remove(&(correlation_id, stage)) {
                    handle.abort();
                }
            }
            CoreCommand::ForceStop {
                node,
                stage,
                correlation_id,
            } => {
                self.watchdogs.remove(&(correlation_id.clone(), stage));
                warn!(node = %node, correlation_id = %correlation_id, "force-stopping node");
                let backend = Arc::clone(&self.backend);
                tokio::spawn(async move {
                    if let Err(e) = backend.stop(&node).await {
                        error!(node = %node, error = %e, "force stop failed");
                    }
                });
            }
            CoreCommand::PublishFailure(event) => {
                let topic = event.topic.clone();
                if let Err(e) = self.publisher.publish(event).await {
                    error!(topic = %topic, error = %e, "failed to publish synthetic failure");
                }
            }
            CoreCommand::RequestExit => {
                info!("core issued RequestExit command");
            }
        }
    }
}
