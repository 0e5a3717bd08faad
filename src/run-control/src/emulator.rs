// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A stand-in for a simulation worker.
//!
//! The [`WorkerEmulator`] follows the worker side of the protocol against any
//! [`ControlStore`] and [`NotificationBus`]: it listens on a run's topic and
//! answers each request it receives. It is used by tests and by the daemon's
//! in-memory mode.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::location::{ControlStore, ExternalError, NotificationBus};
use crate::{
    ControlState, ReplyRecord, RequestEnvelope, RunId, ADVANCE_METHOD, COMPLETE_NOTIFICATION,
    STOP_METHOD,
};

/// How a [`WorkerEmulator`] answers requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorBehavior {
    /// How long each request takes to handle.
    pub step_duration: Duration,
    /// The reply written under the request's correlation id, if any.
    pub reply: Option<String>,
    /// Whether to publish a completion notification after an advance.
    pub notify_complete: bool,
    /// Whether to reset the control state to idle after an advance.
    pub reset_control: bool,
}

impl Default for EmulatorBehavior {
    fn default() -> Self {
        EmulatorBehavior {
            step_duration: Duration::from_millis(100),
            reply: Some(format!(r#"{{"status":"{}"}}"#, ReplyRecord::OK)),
            notify_complete: true,
            reset_control: true,
        }
    }
}

impl EmulatorBehavior {
    /// A worker that steps for `step_duration` and reports back through every
    /// channel.
    pub fn cooperative(step_duration: Duration) -> Self {
        EmulatorBehavior {
            step_duration,
            ..Default::default()
        }
    }

    /// A worker that receives requests but never answers or resets the run.
    pub fn silent() -> Self {
        EmulatorBehavior {
            step_duration: Duration::ZERO,
            reply: None,
            notify_complete: false,
            reset_control: false,
        }
    }

    /// Replaces the reply with a failure carrying `reason`.
    pub fn failing(mut self, reason: &str) -> Self {
        self.reply = Some(serde_json::json!({"status": "error", "reason": reason}).to_string());
        self
    }

    /// Drops the reply record.
    pub fn without_reply(mut self) -> Self {
        self.reply = None;
        self
    }

    /// Drops the completion notification.
    pub fn without_notification(mut self) -> Self {
        self.notify_complete = false;
        self
    }
}

/// Emulates the workers of any number of runs.
#[derive(Debug, Clone)]
pub struct WorkerEmulator {
    store: Arc<dyn ControlStore>,
    bus: Arc<dyn NotificationBus>,
    behavior: Arc<EmulatorBehavior>,
    handled: Arc<Mutex<Vec<(RunId, RequestEnvelope)>>>,
}

impl WorkerEmulator {
    /// Returns an emulator answering through `store` and `bus`.
    pub fn new(
        store: Arc<dyn ControlStore>,
        bus: Arc<dyn NotificationBus>,
        behavior: EmulatorBehavior,
    ) -> Self {
        WorkerEmulator {
            store,
            bus,
            behavior: Arc::new(behavior),
            handled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request received so far, in the order handling began.
    pub fn handled(&self) -> Vec<(RunId, RequestEnvelope)> {
        self.handled.lock().expect("lock poisoned").clone()
    }

    /// Creates `run` with an idle control state.
    pub async fn create_run(&self, run: &RunId) -> Result<(), ExternalError> {
        self.store.set_control(run, ControlState::Idle).await
    }

    /// Starts answering requests on `run`'s topic.
    ///
    /// Returns once subscribed, so requests published afterwards are
    /// guaranteed to be seen. Requests for a run are handled one at a time,
    /// in the order they were published. The worker runs until the returned
    /// handle is aborted or the bus closes the subscription.
    pub async fn serve(
        &self,
        run: RunId,
    ) -> Result<sim_ore::task::JoinHandle<()>, ExternalError> {
        let mut subscription = self.bus.subscribe(&run).await?;
        let worker = self.clone();
        let name = format!("worker-emulator:{run}");
        Ok(sim_ore::task::spawn(move || name, async move {
            info!(%run, "emulated worker listening");
            while let Some(payload) = subscription.next().await {
                // Our own notifications, and anything else that isn't a
                // request, come through here too.
                let Ok(envelope) = serde_json::from_str::<RequestEnvelope>(&payload) else {
                    continue;
                };
                if let Err(err) = worker.handle(&run, envelope).await {
                    warn!(%run, "emulated worker failed to answer: {err}");
                }
            }
            info!(%run, "emulated worker stopped");
        }))
    }

    async fn handle(&self, run: &RunId, envelope: RequestEnvelope) -> Result<(), ExternalError> {
        let behavior = &self.behavior;
        self.handled
            .lock()
            .expect("lock poisoned")
            .push((run.clone(), envelope.clone()));
        debug!(%run, id = %envelope.message_id, method = %envelope.method, "emulating request");

        let advancing = envelope.method == ADVANCE_METHOD;
        if advancing {
            self.store.set_control(run, ControlState::Running).await?;
        }
        tokio::time::sleep(behavior.step_duration).await;

        if let Some(reply) = &behavior.reply {
            self.store
                .set_reply(run, &envelope.message_id, reply)
                .await?;
        }
        if advancing {
            if behavior.notify_complete {
                self.bus
                    .publish(run, COMPLETE_NOTIFICATION.to_owned())
                    .await?;
            }
            if behavior.reset_control {
                self.store.set_control(run, ControlState::Idle).await?;
            }
        } else if envelope.method == STOP_METHOD && behavior.reply.is_some() {
            self.store.set_control(run, ControlState::Idle).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::{MemBus, MemControlStore};
    use crate::CorrelationId;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_advance_protocol() -> Result<(), ExternalError> {
        let store = MemControlStore::new();
        let bus = MemBus::new();
        let emulator = WorkerEmulator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            EmulatorBehavior::cooperative(Duration::from_secs(2)),
        );
        let run: RunId = "site-1".parse().expect("valid");
        emulator.create_run(&run).await?;
        let worker = emulator.serve(run.clone()).await?;

        let id = CorrelationId::new();
        let envelope = RequestEnvelope {
            message_id: id,
            method: ADVANCE_METHOD.into(),
            data: None,
        };
        let mut watcher = bus.subscribe(&run).await?;
        bus.publish(&run, serde_json::to_string(&envelope)?).await?;

        // Echo of the request, then the notification.
        assert!(watcher.next().await.is_some());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.control(&run).await?, Some(ControlState::Running));
        assert_eq!(store.reply(&run, &id).await?, None);

        assert_eq!(watcher.next().await.as_deref(), Some(COMPLETE_NOTIFICATION));
        assert_eq!(
            store.reply(&run, &id).await?.as_deref(),
            Some(r#"{"status":"ok"}"#)
        );
        tokio::task::yield_now().await;
        assert_eq!(store.control(&run).await?, Some(ControlState::Idle));
        assert_eq!(emulator.handled(), vec![(run.clone(), envelope)]);

        worker.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_leaves_no_trace() -> Result<(), ExternalError> {
        let store = MemControlStore::new();
        let bus = MemBus::new();
        let emulator = WorkerEmulator::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            EmulatorBehavior::silent(),
        );
        let run: RunId = "site-1".parse().expect("valid");
        emulator.create_run(&run).await?;
        let _worker = emulator.serve(run.clone()).await?;

        let id = CorrelationId::new();
        let envelope = RequestEnvelope {
            message_id: id,
            method: STOP_METHOD.into(),
            data: None,
        };
        bus.publish(&run, serde_json::to_string(&envelope)?).await?;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(emulator.handled().len(), 1);
        assert_eq!(store.reply(&run, &id).await?, None);
        assert_eq!(bus.published(&run).len(), 1);
        Ok(())
    }
}
