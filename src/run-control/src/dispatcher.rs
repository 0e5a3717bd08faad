// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Single-run commands.

use crate::cfg::WaitConfig;
use crate::correlator::Correlator;
use crate::location::ExternalError;
use crate::{RunId, RunOutcome, StartParams, START_METHOD, STOP_METHOD};

/// Sends commands to a run's worker and waits for the reply.
///
/// Unlike advances, commands take no claim on the run: concurrent commands
/// for the same run are all published, and the control state is never
/// touched.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    correlator: Correlator,
    config: WaitConfig,
}

impl Dispatcher {
    /// Returns a dispatcher waiting on commands as described by `config`.
    pub fn new(correlator: Correlator, config: WaitConfig) -> Self {
        Dispatcher { correlator, config }
    }

    /// Sends an arbitrary `method` to `run`.
    pub async fn send(
        &self,
        run: &RunId,
        method: &str,
        data: Option<serde_json::Value>,
    ) -> Result<RunOutcome, ExternalError> {
        self.correlator
            .request(run, method, data, &self.config)
            .await
    }

    /// Asks `run` to stop.
    pub async fn stop(&self, run: &RunId) -> Result<RunOutcome, ExternalError> {
        self.send(run, STOP_METHOD, None).await
    }

    /// Asks `run` to start with the given parameters.
    pub async fn start(
        &self,
        run: &RunId,
        params: &StartParams,
    ) -> Result<RunOutcome, ExternalError> {
        let data = serde_json::to_value(params)?;
        self.send(run, START_METHOD, Some(data)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sim_ore::metrics::MetricsRegistry;
    use tokio::time::Instant;

    use crate::emulator::{EmulatorBehavior, WorkerEmulator};
    use crate::location::ControlStore;
    use crate::mem::{MemBus, MemControlStore};
    use crate::metrics::Metrics;
    use crate::{ControlState, RequestEnvelope, Resolution};

    use super::*;

    async fn setup(
        behavior: EmulatorBehavior,
    ) -> (MemControlStore, MemBus, Dispatcher, WorkerEmulator, RunId) {
        let store = MemControlStore::new();
        let bus = MemBus::new();
        let metrics = Arc::new(Metrics::register_into(&MetricsRegistry::new()));
        let correlator = Correlator::new(Arc::new(store.clone()), Arc::new(bus.clone()), metrics);
        let dispatcher = Dispatcher::new(correlator, WaitConfig::command_default());
        let emulator = WorkerEmulator::new(Arc::new(store.clone()), Arc::new(bus.clone()), behavior);
        let run: RunId = "site-1".parse().expect("valid");
        emulator.create_run(&run).await.expect("created");
        let _ = emulator.serve(run.clone()).await.expect("serving");
        (store, bus, dispatcher, emulator, run)
    }

    #[tokio::test(start_paused = true)]
    async fn stop_replies() -> Result<(), ExternalError> {
        let (store, _, dispatcher, emulator, run) =
            setup(EmulatorBehavior::cooperative(Duration::from_millis(300))).await;

        let outcome = dispatcher.stop(&run).await?;

        assert!(outcome.status);
        assert_eq!(outcome.resolution, Resolution::Reply);
        assert_eq!(outcome.message, r#"{"status":"ok"}"#);
        assert_eq!(emulator.handled()[0].1.method, "stop");
        assert_eq!(store.control(&run).await?, Some(ControlState::Idle));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn start_carries_params() -> Result<(), ExternalError> {
        let (_, _, dispatcher, emulator, run) =
            setup(EmulatorBehavior::cooperative(Duration::ZERO)).await;
        let params = StartParams {
            start_datetime: Some("2025-01-01 00:00:00".into()),
            end_datetime: Some("2025-01-08 00:00:00".into()),
            timescale: Some(5.0),
            realtime: false,
            external_clock: true,
        };

        let outcome = dispatcher.start(&run, &params).await?;

        assert!(outcome.status);
        let (_, envelope): (RunId, RequestEnvelope) = emulator.handled()[0].clone();
        assert_eq!(envelope.method, "start");
        let sent: StartParams =
            serde_json::from_value(envelope.data.expect("start data")).expect("params");
        assert_eq!(sent, params);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_ignores_notifications_and_control() -> Result<(), ExternalError> {
        // The worker resets the run and notifies but never replies: commands
        // only resolve by reply.
        let (_, _, dispatcher, _, run) = setup(
            EmulatorBehavior::cooperative(Duration::from_millis(100)).without_reply(),
        )
        .await;

        let start = Instant::now();
        let outcome = dispatcher.send(&run, "advance", None).await?;

        assert_eq!(outcome.resolution, Resolution::Timeout);
        assert!(!outcome.status);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(6) + Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_are_both_sent() -> Result<(), ExternalError> {
        let (store, bus, dispatcher, emulator, run) =
            setup(EmulatorBehavior::cooperative(Duration::from_millis(500))).await;
        store.set_control(&run, ControlState::Running).await?;

        let (a, b) = tokio::join!(dispatcher.stop(&run), dispatcher.stop(&run));
        let (a, b) = (a?, b?);

        assert!(a.status && b.status);
        assert_eq!(a.resolution, Resolution::Reply);
        assert_eq!(b.resolution, Resolution::Reply);
        assert_eq!(emulator.handled().len(), 2);
        let ids: Vec<_> = emulator
            .handled()
            .into_iter()
            .map(|(_, envelope)| envelope.message_id)
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(bus.published(&run).len(), 2);
        Ok(())
    }
}
