// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The HTTP API in front of run control.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::future::IntoFuture;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::Encoder;
use serde::Deserialize;
use sim_ore::metrics::MetricsRegistry;
use sim_ore::task::JoinHandle;
use sim_run_control::advancer::Advancer;
use sim_run_control::cfg::RunControlConfig;
use sim_run_control::correlator::Correlator;
use sim_run_control::dispatcher::Dispatcher;
use sim_run_control::location::{ControlStore, ExternalError, NotificationBus};
use sim_run_control::metrics::Metrics;
use sim_run_control::{RunId, RunOutcome, StartParams};
use tokio::net::TcpListener;
use tracing::{debug, warn};

const ADVANCE_BATCH_PATH: &str = "/api/runs/advance";
const ADVANCE_PATH: &str = "/api/runs/:run_id/advance";
const STOP_PATH: &str = "/api/runs/:run_id/stop";
const START_PATH: &str = "/api/runs/:run_id/start";
const LIVEZ_PATH: &str = "/api/livez";
const METRICS_PATH: &str = "/metrics";

/// What a [`ControlServer`] serves.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where run state lives.
    pub store: Arc<dyn ControlStore>,
    /// Where requests are published.
    pub bus: Arc<dyn NotificationBus>,
    /// How requests wait.
    pub run_control: RunControlConfig,
    /// The registry exported at `/metrics`.
    pub metrics_registry: MetricsRegistry,
}

/// A running HTTP server.
#[derive(Debug)]
pub struct ControlServer {
    /// The address the server is bound to.
    pub local_addr: SocketAddr,
    /// `http://` followed by [`Self::local_addr`].
    pub base_url: String,
    /// The task serving requests. It only completes on error.
    pub handle: JoinHandle<Result<(), io::Error>>,
}

impl ControlServer {
    /// Binds to `addr`, or an ephemeral localhost port if `None`, and starts
    /// serving. Must be called from within a [`tokio::runtime::Runtime`].
    ///
    /// Fails without binding if `config.run_control` doesn't validate.
    pub async fn start(
        addr: Option<&SocketAddr>,
        config: ServerConfig,
    ) -> Result<ControlServer, anyhow::Error> {
        config
            .run_control
            .validate()
            .context("invalid run control configuration")?;
        let metrics = Arc::new(Metrics::register_into(&config.metrics_registry));
        let correlator = Correlator::new(Arc::clone(&config.store), config.bus, metrics);
        let context = Arc::new(Context {
            advancer: Advancer::new(correlator.clone(), config.run_control.advance),
            dispatcher: Dispatcher::new(correlator, config.run_control.command),
            store: config.store,
            metrics_registry: config.metrics_registry,
        });

        let router = Router::new()
            .route(ADVANCE_BATCH_PATH, post(handle_advance_batch))
            .route(ADVANCE_PATH, post(handle_advance))
            .route(STOP_PATH, post(handle_stop))
            .route(START_PATH, post(handle_start))
            .route(LIVEZ_PATH, get(handle_liveness_check))
            .route(METRICS_PATH, get(handle_prometheus))
            .with_state(context);

        let addr = match addr {
            Some(addr) => Cow::Borrowed(addr),
            None => Cow::Owned(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        };
        let listener = TcpListener::bind(*addr).await?;
        let local_addr = listener.local_addr()?;
        let server = axum::serve(listener, router);
        let handle = sim_ore::task::spawn(|| "control-server", server.into_future());

        Ok(ControlServer {
            local_addr,
            base_url: format!("http://{}", local_addr),
            handle,
        })
    }
}

#[derive(Debug)]
struct Context {
    advancer: Advancer,
    dispatcher: Dispatcher,
    store: Arc<dyn ControlStore>,
    metrics_registry: MetricsRegistry,
}

impl Context {
    /// Rejects runs that were never created.
    async fn ensure_exists<'a, I>(&self, runs: I) -> Result<(), ApiError>
    where
        I: IntoIterator<Item = &'a RunId>,
    {
        for run in runs {
            if self.store.control(run).await?.is_none() {
                return Err(ApiError::UnknownRun(run.clone()));
            }
        }
        Ok(())
    }
}

/// An error returned by the API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The request named a run that doesn't exist.
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
    /// A single-run request failed.
    #[error("request failed: {}", .0.message)]
    Failed(RunOutcome),
    /// At least one run of a batch failed to advance.
    #[error("{} of {} runs failed to advance", failed_count(.0), .0.len())]
    AdvanceFailed(BTreeMap<RunId, RunOutcome>),
    /// The advancer returned no outcome for the run.
    #[error("no outcome for run: {0}")]
    MissingOutcome(RunId),
    /// The control store or bus is unavailable.
    #[error(transparent)]
    External(#[from] ExternalError),
}

fn failed_count(outcomes: &BTreeMap<RunId, RunOutcome>) -> usize {
    outcomes.values().filter(|outcome| !outcome.status).count()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            e @ ApiError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
            e @ ApiError::UnknownRun(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
            ApiError::Failed(outcome) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(outcome)).into_response()
            }
            ApiError::AdvanceFailed(outcomes) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(outcomes)).into_response()
            }
            e @ ApiError::MissingOutcome(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
            ApiError::External(e) => {
                warn!("run control unavailable: {e}");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
            }
        }
    }
}

fn parse_run_id(raw: String) -> Result<RunId, ApiError> {
    RunId::try_from(raw).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn single_outcome(outcome: RunOutcome) -> Result<RunOutcome, ApiError> {
    if outcome.status {
        Ok(outcome)
    } else {
        Err(ApiError::Failed(outcome))
    }
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    run_ids: Vec<String>,
}

async fn handle_advance_batch(
    State(context): State<Arc<Context>>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<BTreeMap<RunId, RunOutcome>>, ApiError> {
    if request.run_ids.is_empty() {
        return Err(ApiError::InvalidRequest("run_ids must not be empty".into()));
    }
    let runs = request
        .run_ids
        .into_iter()
        .map(parse_run_id)
        .collect::<Result<Vec<_>, _>>()?;
    context
        .ensure_exists(runs.iter().collect::<BTreeSet<_>>())
        .await?;

    let outcomes = context.advancer.advance(&runs).await?;
    debug!(runs = outcomes.len(), "advanced batch");
    if outcomes.values().all(|outcome| outcome.status) {
        Ok(Json(outcomes))
    } else {
        Err(ApiError::AdvanceFailed(outcomes))
    }
}

async fn handle_advance(
    State(context): State<Arc<Context>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunOutcome>, ApiError> {
    let run = parse_run_id(run_id)?;
    context.ensure_exists([&run]).await?;
    let mut outcomes = context.advancer.advance(std::slice::from_ref(&run)).await?;
    match outcomes.remove(&run) {
        Some(outcome) => single_outcome(outcome).map(Json),
        None => Err(ApiError::MissingOutcome(run)),
    }
}

async fn handle_stop(
    State(context): State<Arc<Context>>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let run = parse_run_id(run_id)?;
    context.ensure_exists([&run]).await?;
    single_outcome(context.dispatcher.stop(&run).await?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_start(
    State(context): State<Arc<Context>>,
    Path(run_id): Path<String>,
    Json(params): Json<StartParams>,
) -> Result<StatusCode, ApiError> {
    let run = parse_run_id(run_id)?;
    context.ensure_exists([&run]).await?;
    single_outcome(context.dispatcher.start(&run, &params).await?)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "Liveness check successful!")
}

async fn handle_prometheus(State(context): State<Arc<Context>>) -> Response {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&context.metrics_registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
