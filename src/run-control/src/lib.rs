// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Coordination of simulation runs with out-of-process workers.
//!
//! Clients ask for runs to advance by a timestep, stop, or start. The work
//! itself happens in a worker process that listens on a per-run topic of a
//! [`NotificationBus`](location::NotificationBus) and reports back through a
//! per-run hash in a [`ControlStore`](location::ControlStore). This crate
//! bridges the two:
//!
//!  * The **[`Correlator`](correlator::Correlator)** mints a [`CorrelationId`],
//!    publishes a [`RequestEnvelope`], and waits, with a hard deadline, for
//!    whichever of a reply record, a `"complete"` notification, or (for
//!    advances) a revert of the run's [`ControlState`] to idle shows up first.
//!
//!  * The **[`Advancer`](advancer::Advancer)** claims exclusive advance rights
//!    for every run in a batch with a compare-and-set on the control state and
//!    fans the batch out to one task per run.
//!
//!  * The **[`Dispatcher`](dispatcher::Dispatcher)** sends single-run commands
//!    (`stop`, `start`) without any exclusivity.
//!
//! Business-level failures (a busy run, a worker that never answers) are
//! reported as a [`RunOutcome`] with `status: false`; only failures to talk to
//! the store or bus surface as [`ExternalError`](location::ExternalError).

#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod advancer;
pub mod cfg;
pub mod correlator;
pub mod dispatcher;
pub mod emulator;
pub mod location;
pub mod mem;
pub mod metrics;
pub mod redis;

/// The hash field holding a run's [`ControlState`].
pub const CONTROL_FIELD: &str = "control";

/// The bus payload a worker publishes once a step has finished.
pub const COMPLETE_NOTIFICATION: &str = "complete";

/// Message of a [`RunOutcome`] for a run that was already mid-advance.
pub const BUSY_MESSAGE: &str = "busy";

/// Message of a [`RunOutcome`] resolved without a reply record.
pub const SUCCESS_MESSAGE: &str = "success";

/// Message of a [`RunOutcome`] for a request that timed out.
pub const NO_REPLY_MESSAGE: &str = "no simulation reply";

/// The method name of an advance request.
pub const ADVANCE_METHOD: &str = "advance";

/// The method name of a stop command.
pub const STOP_METHOD: &str = "stop";

/// The method name of a start command.
pub const START_METHOD: &str = "start";

/// The identifier of a simulation run.
///
/// Doubles as the key of the run's hash in the control store and as the name
/// of the run's topic on the notification bus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error returned when parsing an empty run id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run id must not be empty")]
pub struct InvalidRunId;

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(id: String) -> Result<RunId, InvalidRunId> {
        if id.is_empty() {
            return Err(InvalidRunId);
        }
        Ok(RunId(id))
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<RunId, InvalidRunId> {
        RunId::try_from(s.to_owned())
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> String {
        id.0
    }
}

/// The per-run flag guarding advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    /// No step is requested or in progress.
    Idle,
    /// An advance has been claimed and requested but not yet picked up.
    Advance,
    /// A worker is executing a step.
    Running,
}

impl ControlState {
    /// Returns the stored representation of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Idle => "idle",
            ControlState::Advance => "advance",
            ControlState::Running => "running",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlState {
    type Err = String;

    fn from_str(s: &str) -> Result<ControlState, String> {
        match s {
            "idle" => Ok(ControlState::Idle),
            "advance" => Ok(ControlState::Advance),
            "running" => Ok(ControlState::Running),
            other => Err(format!("unknown control state: {other:?}")),
        }
    }
}

/// A unique, time-ordered id naming one request and its reply slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Mints a new id. Ids are never reused.
    pub fn new() -> CorrelationId {
        CorrelationId(Uuid::now_v7())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        CorrelationId::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<CorrelationId, uuid::Error> {
        Ok(CorrelationId(s.parse()?))
    }
}

/// The message published on a run's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Names the reply slot the worker must write.
    pub message_id: CorrelationId,
    /// The requested action, e.g. `advance` or `stop`.
    pub method: String,
    /// Method-specific parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The reply a worker writes under a request's [`CorrelationId`].
///
/// Workers may include additional fields; they are ignored here and preserved
/// in the raw reply carried by [`RunOutcome::message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRecord {
    /// `"ok"` on success; anything else is a failure.
    pub status: String,
}

impl ReplyRecord {
    /// The status written by a worker that succeeded.
    pub const OK: &'static str = "ok";

    /// Whether the worker reported success.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyRecord::OK
    }
}

/// Which path decided a [`RunOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The worker wrote a reply record.
    Reply,
    /// The worker published a completion notification.
    Complete,
    /// The run's control state reverted to idle without a reply or
    /// notification being observed. The worker may have succeeded or may have
    /// failed and reset the run without reporting; the two are
    /// indistinguishable here.
    IdleFallback,
    /// Nothing was observed before the deadline.
    Timeout,
    /// The run was already mid-advance, so no request was sent.
    Busy,
}

impl Resolution {
    /// A short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Reply => "reply",
            Resolution::Complete => "complete",
            Resolution::IdleFallback => "idle_fallback",
            Resolution::Timeout => "timeout",
            Resolution::Busy => "busy",
        }
    }
}

/// The final result of a request against one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Whether the request should be considered successful by the caller.
    pub status: bool,
    /// A human readable message, or the raw reply written by the worker.
    pub message: String,
    /// Which path decided this outcome.
    #[serde(skip)]
    pub resolution: Resolution,
}

impl RunOutcome {
    /// The outcome for a run that was already advancing.
    ///
    /// Not an error: the caller asked for the run to make progress and it is.
    pub fn busy() -> RunOutcome {
        RunOutcome {
            status: true,
            message: BUSY_MESSAGE.into(),
            resolution: Resolution::Busy,
        }
    }

    /// The outcome when a worker published a completion notification.
    pub fn complete() -> RunOutcome {
        RunOutcome {
            status: true,
            message: SUCCESS_MESSAGE.into(),
            resolution: Resolution::Complete,
        }
    }

    /// The outcome when the control state reverted to idle unannounced.
    pub fn idle_fallback() -> RunOutcome {
        RunOutcome {
            status: true,
            message: SUCCESS_MESSAGE.into(),
            resolution: Resolution::IdleFallback,
        }
    }

    /// The outcome when nothing was heard before the deadline.
    pub fn timed_out() -> RunOutcome {
        RunOutcome {
            status: false,
            message: NO_REPLY_MESSAGE.into(),
            resolution: Resolution::Timeout,
        }
    }

    /// The outcome for a raw reply read from a run's reply slot.
    ///
    /// A reply that is not a valid [`ReplyRecord`] counts as a failure.
    pub fn from_reply(raw: String) -> RunOutcome {
        let status = match serde_json::from_str::<ReplyRecord>(&raw) {
            Ok(record) => record.is_ok(),
            Err(err) => {
                tracing::warn!("malformed simulation reply {raw:?}: {err}");
                false
            }
        };
        RunOutcome {
            status,
            message: raw,
            resolution: Resolution::Reply,
        }
    }
}

/// Parameters of a `start` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    /// Simulation time at which the run begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_datetime: Option<String>,
    /// Simulation time at which the run ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<String>,
    /// Simulated seconds per wall-clock second, for timescaled runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<f64>,
    /// Run in lockstep with wall-clock time.
    #[serde(default)]
    pub realtime: bool,
    /// Only step when asked to via advance requests.
    #[serde(default)]
    pub external_clock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_rejects_empty() {
        assert_eq!("".parse::<RunId>(), Err(InvalidRunId));
        assert!(serde_json::from_str::<RunId>("\"\"").is_err());
        let id: RunId = serde_json::from_str("\"site-1\"").expect("valid id");
        assert_eq!(id.as_str(), "site-1");
        assert_eq!(serde_json::to_string(&id).expect("serializable"), "\"site-1\"");
    }

    #[test]
    fn control_state_strings() {
        for state in [ControlState::Idle, ControlState::Advance, ControlState::Running] {
            assert_eq!(state.as_str().parse::<ControlState>(), Ok(state));
        }
        assert!("paused".parse::<ControlState>().is_err());
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<CorrelationId>().expect("round trip"), a);
    }

    #[test]
    fn envelope_wire_format() {
        let id: CorrelationId = "0190c2a4-8f5e-7c3a-9b1d-2f4e6a8c0b1d".parse().expect("valid");
        let envelope = RequestEnvelope {
            message_id: id,
            method: ADVANCE_METHOD.into(),
            data: None,
        };
        assert_eq!(
            serde_json::to_string(&envelope).expect("serializable"),
            r#"{"message_id":"0190c2a4-8f5e-7c3a-9b1d-2f4e6a8c0b1d","method":"advance"}"#
        );
    }

    #[test]
    fn outcome_from_reply() {
        let ok = RunOutcome::from_reply(r#"{"status":"ok","step":12}"#.into());
        assert!(ok.status);
        assert_eq!(ok.message, r#"{"status":"ok","step":12}"#);
        assert_eq!(ok.resolution, Resolution::Reply);

        let failed = RunOutcome::from_reply(r#"{"status":"error"}"#.into());
        assert!(!failed.status);

        let garbage = RunOutcome::from_reply("not json".into());
        assert!(!garbage.status);
        assert_eq!(garbage.message, "not json");
    }

    #[test]
    fn outcome_wire_format_omits_resolution() {
        let json = serde_json::to_value(RunOutcome::busy()).expect("serializable");
        assert_eq!(json, serde_json::json!({"status": true, "message": "busy"}));
    }
}
