// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use sim_ore::metric;
use sim_ore::metrics::{HistogramVec, IntCounterVec, IntGauge, MetricsRegistry};

/// Metrics for run control.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub(crate) requests_started: IntCounterVec,
    pub(crate) requests_resolved: IntCounterVec,
    pub(crate) request_seconds: HistogramVec,
    pub(crate) inflight_requests: IntGauge,
    pub(crate) external_errors: IntCounterVec,
    pub(crate) advance_claims: IntCounterVec,
}

impl Metrics {
    /// Returns a new [Metrics] instance connected to the given registry.
    pub fn register_into(registry: &MetricsRegistry) -> Self {
        Metrics {
            requests_started: registry.register(metric!(
                name: "sim_run_control_requests_started",
                help: "count of requests published to workers",
                var_labels: ["method"],
            )),
            requests_resolved: registry.register(metric!(
                name: "sim_run_control_requests_resolved",
                help: "count of requests resolved, by the path that resolved them",
                var_labels: ["method", "resolution"],
            )),
            request_seconds: registry.register(metric!(
                name: "sim_run_control_request_seconds",
                help: "time from publishing a request to its resolution",
                var_labels: ["method"],
            )),
            inflight_requests: registry.register(metric!(
                name: "sim_run_control_inflight_requests",
                help: "number of requests waiting on a worker",
            )),
            external_errors: registry.register(metric!(
                name: "sim_run_control_external_errors",
                help: "count of requests failed by the control store or bus",
                var_labels: ["method", "kind"],
            )),
            advance_claims: registry.register(metric!(
                name: "sim_run_control_advance_claims",
                help: "count of attempts to claim a run for advancing",
                var_labels: ["result"],
            )),
        }
    }
}
