// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Exclusive, batched advancement of runs.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use tracing::debug;

use crate::cfg::WaitConfig;
use crate::correlator::Correlator;
use crate::location::{CaSResult, ExternalError};
use crate::{ControlState, RunId, RunOutcome, ADVANCE_METHOD};

/// Advances runs by one step each.
///
/// At most one advance is in flight per run at any time, across every
/// `Advancer` sharing the same control store: a run is claimed with a
/// compare-and-set of its control state before the request is published, and
/// a run that can't be claimed reports [`RunOutcome::busy`] without any
/// request being sent.
#[derive(Debug, Clone)]
pub struct Advancer {
    correlator: Correlator,
    config: WaitConfig,
}

impl Advancer {
    /// Returns an advancer waiting on requests as described by `config`.
    pub fn new(correlator: Correlator, config: WaitConfig) -> Self {
        Advancer { correlator, config }
    }

    /// Advances every run in `runs` concurrently and returns one outcome per
    /// distinct run.
    ///
    /// Runs are independent of each other: a slow or silent run doesn't delay
    /// the others, though the call as a whole returns only once every run has
    /// resolved. A run listed more than once is attempted once per listing and
    /// reports the outcome of its first listing. The first failure to talk to
    /// the store or bus fails the whole call; the attempts on the remaining
    /// runs carry on in the background.
    pub async fn advance(
        &self,
        runs: &[RunId],
    ) -> Result<BTreeMap<RunId, RunOutcome>, ExternalError> {
        let handles = runs.iter().map(|run| {
            let advancer = self.clone();
            let run = run.clone();
            let name = format!("advance:{run}");
            sim_ore::task::spawn(move || name, async move {
                let outcome = advancer.advance_one(&run).await?;
                Ok::<_, ExternalError>((run, outcome))
            })
        });
        let outcomes = try_join_all(handles).await?;

        let mut results = BTreeMap::new();
        for (run, outcome) in outcomes {
            results.entry(run).or_insert(outcome);
        }
        Ok(results)
    }

    async fn advance_one(&self, run: &RunId) -> Result<RunOutcome, ExternalError> {
        let store = self.correlator.store();
        let claims = &self.correlator.metrics().advance_claims;

        let observed = store.control(run).await?;
        if let Some(state @ (ControlState::Advance | ControlState::Running)) = observed {
            debug!(%run, %state, "run is busy, not advancing");
            claims.with_label_values(&["busy"]).inc();
            return Ok(RunOutcome::busy());
        }
        match store
            .compare_and_set_control(run, observed, ControlState::Advance)
            .await?
        {
            CaSResult::Committed => {
                claims.with_label_values(&["claimed"]).inc();
            }
            CaSResult::ExpectationMismatch => {
                debug!(%run, "lost the race to advance run");
                claims.with_label_values(&["lost_race"]).inc();
                return Ok(RunOutcome::busy());
            }
        }

        self.correlator
            .request(run, ADVANCE_METHOD, None, &self.config)
            .await
    }
}
