// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tunable knobs of run control.

use std::time::Duration;

use anyhow::Context;

/// The default upper bound on how long an advance may take.
pub const ADVANCE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// The default interval at which an advance's reply slot is polled.
pub const ADVANCE_POLL_INTERVAL_DEFAULT: Duration = Duration::from_millis(250);

/// The default upper bound on how long a command may take.
pub const COMMAND_TIMEOUT_DEFAULT: Duration = Duration::from_secs(6);

/// The default interval at which a command's reply slot is polled.
pub const COMMAND_POLL_INTERVAL_DEFAULT: Duration = Duration::from_millis(100);

/// How a [`Correlator`](crate::correlator::Correlator) waits for a request to
/// resolve.
///
/// Both durations must be non-zero; see [`WaitConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// The request resolves as timed out once this much time has passed since
    /// it was published, and never earlier.
    pub timeout: Duration,
    /// How often the reply slot (and, with `idle_fallback`, the control state)
    /// is read.
    pub poll_interval: Duration,
    /// Resolve as soon as the worker publishes a completion notification.
    pub accept_complete: bool,
    /// Resolve once the run's control state reads as idle again, even if no
    /// reply or notification was seen.
    pub idle_fallback: bool,
}

impl WaitConfig {
    /// The defaults for advance requests.
    pub const fn advance_default() -> WaitConfig {
        WaitConfig {
            timeout: ADVANCE_TIMEOUT_DEFAULT,
            poll_interval: ADVANCE_POLL_INTERVAL_DEFAULT,
            accept_complete: true,
            idle_fallback: true,
        }
    }

    /// The defaults for commands.
    pub const fn command_default() -> WaitConfig {
        WaitConfig {
            timeout: COMMAND_TIMEOUT_DEFAULT,
            poll_interval: COMMAND_POLL_INTERVAL_DEFAULT,
            accept_complete: false,
            idle_fallback: false,
        }
    }

    /// Rejects configurations that can't be waited on.
    pub fn validate(&self) -> Result<(), InvalidWaitConfig> {
        if self.timeout.is_zero() {
            return Err(InvalidWaitConfig::ZeroTimeout);
        }
        if self.poll_interval.is_zero() {
            return Err(InvalidWaitConfig::ZeroPollInterval);
        }
        Ok(())
    }
}

/// An error returned by [`WaitConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidWaitConfig {
    /// The timeout was zero.
    #[error("timeout must be non-zero")]
    ZeroTimeout,
    /// The poll interval was zero.
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
}

/// The configuration of an [`Advancer`](crate::advancer::Advancer) and a
/// [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunControlConfig {
    /// How advances wait.
    pub advance: WaitConfig,
    /// How commands wait.
    pub command: WaitConfig,
}

impl Default for RunControlConfig {
    fn default() -> Self {
        RunControlConfig {
            advance: WaitConfig::advance_default(),
            command: WaitConfig::command_default(),
        }
    }
}

impl RunControlConfig {
    /// Overrides the advance timing, keeping its resolution paths.
    pub fn with_advance_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.advance.timeout = timeout;
        self.advance.poll_interval = poll_interval;
        self
    }

    /// Overrides the command timing, keeping its resolution paths.
    pub fn with_command_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.command.timeout = timeout;
        self.command.poll_interval = poll_interval;
        self
    }

    /// Validates both the advance and the command configuration.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.advance.validate().context("advance")?;
        self.command.validate().context("command")?;
        Ok(())
    }
}
