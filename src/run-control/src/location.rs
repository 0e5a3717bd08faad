// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Abstractions over the external systems shared with simulation workers.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{ControlState, CorrelationId, RunId};

/// An error coming from an external system (the control store or the bus).
///
/// This is distinct from a run that simply didn't answer: it means the request
/// couldn't be made or observed at all.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    /// The control store could not be reached or returned an error.
    #[error("control store: {0:#}")]
    Store(anyhow::Error),
    /// The notification bus could not be reached or returned an error.
    #[error("notification bus: {0:#}")]
    Bus(anyhow::Error),
    /// A message could not be encoded.
    #[error("encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ExternalError {
    /// A short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExternalError::Store(_) => "store",
            ExternalError::Bus(_) => "bus",
            ExternalError::Codec(_) => "codec",
        }
    }
}

/// The result of [`ControlStore::compare_and_set_control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaSResult {
    /// The compare-and-set operation successfully committed the update.
    Committed,
    /// The compare-and-set operation failed to commit the update because the
    /// stored state didn't match the expectation.
    ExpectationMismatch,
}

/// A per-run key/value hash holding the run's [`ControlState`] and the reply
/// slots workers write.
#[async_trait]
pub trait ControlStore: fmt::Debug + Send + Sync {
    /// Returns the run's control state, or `None` if it has none.
    async fn control(&self, run: &RunId) -> Result<Option<ControlState>, ExternalError>;

    /// Unconditionally overwrites the run's control state.
    ///
    /// Used when a run is created and by workers. The coordination code only
    /// ever transitions the control state via
    /// [`Self::compare_and_set_control`].
    async fn set_control(&self, run: &RunId, state: ControlState) -> Result<(), ExternalError>;

    /// Atomically replaces the run's control state with `new` iff it is
    /// currently `expected`, where `None` means the run has no control state.
    ///
    /// No concurrent call for the same run may observe the state between the
    /// comparison and the write.
    async fn compare_and_set_control(
        &self,
        run: &RunId,
        expected: Option<ControlState>,
        new: ControlState,
    ) -> Result<CaSResult, ExternalError>;

    /// Returns the raw reply written for the given request, if any.
    async fn reply(&self, run: &RunId, id: &CorrelationId)
        -> Result<Option<String>, ExternalError>;

    /// Writes the raw reply for the given request.
    async fn set_reply(
        &self,
        run: &RunId,
        id: &CorrelationId,
        reply: &str,
    ) -> Result<(), ExternalError>;
}

/// A publish/subscribe transport with one topic per run.
#[async_trait]
pub trait NotificationBus: fmt::Debug + Send + Sync {
    /// Publishes `payload` to every current subscriber of `topic`.
    async fn publish(&self, topic: &RunId, payload: String) -> Result<(), ExternalError>;

    /// Subscribes to `topic`.
    ///
    /// Only messages published after this returns are guaranteed to be
    /// delivered. Dropping the returned [`Subscription`] unsubscribes.
    async fn subscribe(&self, topic: &RunId) -> Result<Subscription, ExternalError>;
}

/// A live subscription to one topic of a [`NotificationBus`].
pub struct Subscription {
    topic: RunId,
    messages: Pin<Box<dyn Stream<Item = String> + Send>>,
}

impl Subscription {
    /// Wraps a stream of payloads.
    ///
    /// Whatever resources keep the subscription alive must be owned by the
    /// stream, so that dropping it unsubscribes.
    pub fn new<S>(topic: RunId, messages: S) -> Subscription
    where
        S: Stream<Item = String> + Send + 'static,
    {
        Subscription {
            topic,
            messages: Box::pin(messages),
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &RunId {
        &self.topic
    }

    /// Waits for the next payload, or `None` if the subscription was closed
    /// by the bus.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
