// src/controller/task.rs

//! Driving a controller from its trigger source.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Controller, Decision, ScheduleTick, Trigger};
use crate::bus::Subscription;
use crate::engine::RuntimeEvent;
use crate::node::{self, NodeBackend};

/// Where a controller's triggers come from.
#[derive(Debug)]
pub enum TriggerSource {
    Ticks(mpsc::UnboundedReceiver<ScheduleTick>),
    Topic(Subscription),
}

impl TriggerSource {
    async fn next(&mut self) -> Option<Trigger> {
        match self {
            TriggerSource::Ticks(rx) => rx.recv().await.map(Trigger::Tick),
            TriggerSource::Topic(sub) => sub.recv().await.map(Trigger::Event),
        }
    }
}

/// Run `controller` on its own task until its trigger source closes.
///
/// Every issued action is reported to the runtime, together with the trigger
/// that caused it, before the backend is called.
pub fn spawn_controller(
    mut controller: Controller,
    mut source: TriggerSource,
    backend: Arc<dyn NodeBackend>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = controller.kind();
        debug!(controller = %kind, node = controller.node(), "controller started");

        while let Some(trigger) = source.next().await {
            let state = backend.state(controller.node());
            let action = match controller.decide(&trigger, state) {
                Decision::Act(action) => action,
                Decision::Ignore(reason) => {
                    debug!(
                        controller = %kind,
                        correlation_id = %trigger.correlation_id(),
                        ?reason,
                        ?state,
                        "trigger ignored"
                    );
                    continue;
                }
            };

            info!(
                controller = %kind,
                node = %action.node,
                action = ?action.kind,
                correlation_id = %action.correlation_id,
                "issuing lifecycle action"
            );

            if runtime_tx
                .send(RuntimeEvent::ActionIssued {
                    controller: kind,
                    action: action.clone(),
                    trigger,
                })
                .await
                .is_err()
            {
                debug!(controller = %kind, "runtime gone; controller exiting");
                break;
            }

            if let Err(e) = node::apply(backend.as_ref(), &action).await {
                error!(
                    controller = %kind,
                    node = %action.node,
                    error = %e,
                    "lifecycle action failed"
                );
                let _ = runtime_tx
                    .send(RuntimeEvent::ActionFailed {
                        controller: kind,
                        action,
                        error: e.to_string(),
                    })
                    .await;
            }
        }

        debug!(controller = %kind, "controller stopped");
    })
}
