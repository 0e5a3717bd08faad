// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Request/reply over a notification bus and a control store.
//!
//! Workers never answer on the bus directly. Instead a request names a fresh
//! [`CorrelationId`] and the worker writes its reply into the run's hash under
//! that id. The [`Correlator`] polls for it, optionally short-circuited by a
//! `"complete"` notification on the run's topic or by the run's control state
//! reverting to idle, and gives up after a fixed deadline.

use std::sync::Arc;

use sim_ore::metrics::GaugeGuard;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cfg::WaitConfig;
use crate::location::{ControlStore, ExternalError, NotificationBus, Subscription};
use crate::metrics::Metrics;
use crate::{
    ControlState, CorrelationId, RequestEnvelope, RunId, RunOutcome, COMPLETE_NOTIFICATION,
};

/// Publishes requests to workers and waits for them to resolve.
///
/// Cheap to clone; clones share the same store, bus and metrics.
#[derive(Debug, Clone)]
pub struct Correlator {
    store: Arc<dyn ControlStore>,
    bus: Arc<dyn NotificationBus>,
    metrics: Arc<Metrics>,
}

enum Event {
    Notification(Option<String>),
    Poll,
    Deadline,
}

impl Correlator {
    /// Returns a new correlator over the given store and bus.
    pub fn new(
        store: Arc<dyn ControlStore>,
        bus: Arc<dyn NotificationBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Correlator {
            store,
            bus,
            metrics,
        }
    }

    /// The control store requests are correlated through.
    pub fn store(&self) -> &Arc<dyn ControlStore> {
        &self.store
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Publishes a `method` request to `run` and waits for it to resolve.
    ///
    /// Exactly one outcome is produced, by whichever of the paths enabled in
    /// `config` fires first. A worker that never answers resolves as timed out
    /// once `config.timeout` has elapsed. Errors are reserved for failures to
    /// talk to the store or bus; the bus subscription is released on every
    /// path out of this function.
    pub async fn request(
        &self,
        run: &RunId,
        method: &str,
        data: Option<serde_json::Value>,
        config: &WaitConfig,
    ) -> Result<RunOutcome, ExternalError> {
        let _inflight = GaugeGuard::from(self.metrics.inflight_requests.clone());
        self.metrics
            .requests_started
            .with_label_values(&[method])
            .inc();
        let start = Instant::now();

        let result = self.request_inner(run, method, data, config).await;

        match &result {
            Ok(outcome) => {
                self.metrics
                    .requests_resolved
                    .with_label_values(&[method, outcome.resolution.as_str()])
                    .inc();
                self.metrics
                    .request_seconds
                    .with_label_values(&[method])
                    .observe(start.elapsed().as_secs_f64());
            }
            Err(err) => {
                self.metrics
                    .external_errors
                    .with_label_values(&[method, err.kind()])
                    .inc();
            }
        }
        result
    }

    async fn request_inner(
        &self,
        run: &RunId,
        method: &str,
        data: Option<serde_json::Value>,
        config: &WaitConfig,
    ) -> Result<RunOutcome, ExternalError> {
        let id = CorrelationId::new();

        // Subscribe before publishing, or a fast worker's notification could
        // be missed.
        let mut notifications = if config.accept_complete {
            Some(self.bus.subscribe(run).await?)
        } else {
            None
        };

        let envelope = RequestEnvelope {
            message_id: id,
            method: method.to_owned(),
            data,
        };
        self.bus
            .publish(run, serde_json::to_string(&envelope)?)
            .await?;
        debug!(%run, %id, method, "published request");

        let deadline = time::sleep_until(Instant::now() + config.timeout);
        tokio::pin!(deadline);
        let mut poll = time::interval_at(
            Instant::now() + config.poll_interval,
            config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                payload = next_notification(&mut notifications) => Event::Notification(payload),
                _ = poll.tick() => Event::Poll,
                () = &mut deadline => Event::Deadline,
            };

            match event {
                Event::Notification(Some(payload)) if payload == COMPLETE_NOTIFICATION => {
                    debug!(%run, %id, method, "resolved by completion notification");
                    return Ok(RunOutcome::complete());
                }
                // Includes the echo of our own request.
                Event::Notification(Some(_)) => {}
                Event::Notification(None) => {
                    warn!(%run, %id, "notification subscription closed, continuing by polling");
                    notifications = None;
                }
                Event::Poll => {
                    if let Some(reply) = self.store.reply(run, &id).await? {
                        debug!(%run, %id, method, %reply, "resolved by reply");
                        return Ok(RunOutcome::from_reply(reply));
                    }
                    if config.idle_fallback
                        && self.store.control(run).await? == Some(ControlState::Idle)
                    {
                        // Workers write their reply before resetting the
                        // control state, so it may have landed since the read
                        // above.
                        if let Some(reply) = self.store.reply(run, &id).await? {
                            debug!(%run, %id, method, %reply, "resolved by reply");
                            return Ok(RunOutcome::from_reply(reply));
                        }
                        debug!(%run, %id, method, "resolved by control state reverting to idle");
                        return Ok(RunOutcome::idle_fallback());
                    }
                }
                Event::Deadline => {
                    warn!(
                        %run, %id, method,
                        "no simulation reply within {:?}", config.timeout
                    );
                    return Ok(RunOutcome::timed_out());
                }
            }
        }
    }
}

/// Waits for the next notification, or forever without a subscription.
async fn next_notification(subscription: &mut Option<Subscription>) -> Option<String> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
