// src/engine/orchestrator.rs

//! Wiring of bus, controllers, nodes and runtime into one running pipeline.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::core::CoreRuntime;
use super::runtime::Runtime;
use super::schedule::{DailySchedule, spawn_scheduler};
use super::{RuntimeEvent, RuntimeOptions};
use crate::bus::{EventBus, EventPublisher, InMemoryBus, Subscription};
use crate::config::ConfigFile;
use crate::controller::{Controller, ScheduleTick, TriggerSource, spawn_controller};
use crate::errors::Result;
use crate::node::{NodeBackend, NodeTable};
use crate::types::{CorrelationId, StageId};

const RUNTIME_CHANNEL_CAPACITY: usize = 64;

/// Delivers a tick to the runtime and then to the schedule-driven
/// controller, in that order.
#[derive(Debug, Clone)]
pub struct Ticker {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    tick_tx: mpsc::UnboundedSender<ScheduleTick>,
}

impl Ticker {
    pub async fn fire(&self, tick: ScheduleTick) -> Result<()> {
        self.runtime_tx
            .send(RuntimeEvent::Tick(tick.clone()))
            .await
            .map_err(|_| anyhow!("runtime has shut down"))?;
        self.tick_tx
            .send(tick)
            .map_err(|_| anyhow!("activation controller has shut down"))?;
        Ok(())
    }
}

/// Builder for a running pipeline.
pub struct Orchestrator {
    cfg: ConfigFile,
    bus: InMemoryBus,
    backend: Arc<dyn NodeBackend>,
    nodes: NodeTable,
    options: RuntimeOptions,
    schedule: Option<DailySchedule>,
}

impl Orchestrator {
    /// `nodes` must be the table `backend` reports its state changes to.
    pub fn new(
        cfg: &ConfigFile,
        bus: InMemoryBus,
        backend: Arc<dyn NodeBackend>,
        nodes: NodeTable,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            bus,
            backend,
            nodes,
            options: RuntimeOptions {
                exit_when_settled: false,
                watchdog_timeout: cfg.pipeline.watchdog_timeout,
            },
            schedule: None,
        }
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn exit_when_settled(mut self, yes: bool) -> Self {
        self.options.exit_when_settled = yes;
        self
    }

    pub fn watchdog_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.watchdog_timeout = timeout;
        self
    }

    /// Fire ticks from the configured daily schedule.
    pub fn with_schedule(mut self) -> Self {
        self.schedule = Some(DailySchedule::from_settings(&self.cfg.pipeline));
        self
    }

    /// Subscribe everything and start all tasks. Every subscription exists
    /// before this returns, so nothing published afterwards is missed.
    pub fn spawn(self) -> OrchestratorHandle {
        let (runtime_tx, runtime_rx) = mpsc::channel(RUNTIME_CHANNEL_CAPACITY);
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        for stage in StageId::ALL {
            let sub = self.bus.subscribe(self.cfg.topic(stage));
            tasks.push(spawn_event_pump(sub, runtime_tx.clone()));
        }
        tasks.push(spawn_node_watch(&self.nodes, runtime_tx.clone()));

        let mut tick_rx = Some(tick_rx);
        for controller in Controller::pipeline(&self.cfg) {
            let source = match controller.topic() {
                Some(topic) => TriggerSource::Topic(self.bus.subscribe(topic)),
                None => match tick_rx.take() {
                    Some(rx) => TriggerSource::Ticks(rx),
                    None => continue,
                },
            };
            tasks.push(spawn_controller(
                controller,
                source,
                Arc::clone(&self.backend),
                runtime_tx.clone(),
            ));
        }

        let ticker = Ticker {
            runtime_tx: runtime_tx.clone(),
            tick_tx,
        };
        if let Some(schedule) = self.schedule {
            tasks.push(spawn_scheduler(schedule, ticker.clone()));
        }

        let core = CoreRuntime::from_config(&self.cfg, self.options);
        let publisher: Arc<dyn EventPublisher> = Arc::new(self.bus.clone());
        let runtime = Runtime::new(
            core,
            runtime_rx,
            runtime_tx.clone(),
            Arc::clone(&self.backend),
            publisher,
        );

        info!(pipeline = %self.cfg.pipeline.name, "orchestrator started");
        OrchestratorHandle {
            ticker,
            runtime_tx,
            runtime: tokio::spawn(runtime.run()),
            tasks,
        }
    }
}

/// Control over a spawned orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    ticker: Ticker,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    runtime: JoinHandle<Result<CoreRuntime>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn ticker(&self) -> Ticker {
        self.ticker.clone()
    }

    pub async fn fire(&self, tick: ScheduleTick) -> Result<()> {
        self.ticker.fire(tick).await
    }

    /// Fire a tick for a fresh run right now.
    pub async fn fire_now(&self) -> Result<CorrelationId> {
        let tick = ScheduleTick::now();
        let cid = tick.correlation_id.clone();
        self.fire(tick).await?;
        Ok(cid)
    }

    /// Raw access to the runtime's event channel, e.g. for signal handlers.
    pub fn runtime_sender(&self) -> mpsc::Sender<RuntimeEvent> {
        self.runtime_tx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.runtime_tx.send(RuntimeEvent::ShutdownRequested).await;
    }

    /// Wait for the runtime to exit and hand back its final state.
    pub async fn wait(self) -> Result<CoreRuntime> {
        let result = self
            .runtime
            .await
            .map_err(|e| anyhow!("runtime task failed: {e}"))?;
        for task in self.tasks {
            task.abort();
        }
        result
    }
}

fn spawn_event_pump(mut sub: Subscription, runtime_tx: mpsc::Sender<RuntimeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            if runtime_tx.send(RuntimeEvent::BusEvent(event)).await.is_err() {
                break;
            }
        }
        debug!(topic = sub.topic(), "event pump stopped");
    })
}

fn spawn_node_watch(nodes: &NodeTable, runtime_tx: mpsc::Sender<RuntimeEvent>) -> JoinHandle<()> {
    let mut changes = nodes.watch();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            if runtime_tx.send(RuntimeEvent::NodeChanged(change)).await.is_err() {
                break;
            }
        }
    })
}
