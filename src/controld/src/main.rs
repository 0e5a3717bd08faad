// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Coordinates simulation runs on behalf of HTTP clients.
//!
//! Run state and worker traffic go through Redis, or, with `--in-memory`,
//! through in-process fakes answered by emulated workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sim_controld::{ControlServer, ServerConfig};
use sim_ore::cli::{self, CliConfig};
use sim_ore::metrics::MetricsRegistry;
use sim_ore::tracing::StderrLogConfig;
use sim_run_control::cfg::RunControlConfig;
use sim_run_control::emulator::{EmulatorBehavior, WorkerEmulator};
use sim_run_control::location::{ControlStore, NotificationBus};
use sim_run_control::mem::{MemBus, MemControlStore};
use sim_run_control::redis::{RedisBus, RedisConfig, RedisControlStore};
use sim_run_control::RunId;
use tracing::info;
use tracing_subscriber::filter::Targets;

#[derive(Debug, clap::Parser)]
#[clap(about = "Simulation run control daemon", long_about = None)]
struct Args {
    /// Listen address for the HTTP API; supports DNS names.
    #[clap(
        long,
        env = "SIM_CONTROLD_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:6880"
    )]
    listen_addr: String,
    /// Redis server holding run state and carrying worker traffic.
    #[clap(
        long,
        env = "SIM_CONTROLD_REDIS_URL",
        value_name = "URL",
        required_unless_present = "in_memory"
    )]
    redis_url: Option<String>,
    /// Keep run state in memory and answer requests with emulated workers.
    #[clap(long, env = "SIM_CONTROLD_IN_MEMORY", conflicts_with = "redis_url")]
    in_memory: bool,
    /// A run to create at startup. Only valid with `--in-memory`.
    #[clap(
        long = "seed-run",
        env = "SIM_CONTROLD_SEED_RUNS",
        value_name = "RUN_ID",
        value_delimiter = ',',
        requires = "in_memory"
    )]
    seed_runs: Vec<RunId>,
    /// How long an emulated worker takes to step.
    #[clap(
        long,
        env = "SIM_CONTROLD_EMULATED_STEP_DURATION",
        value_parser = humantime::parse_duration,
        default_value = "1s"
    )]
    emulated_step_duration: Duration,
    /// How long to wait for an advance before reporting no reply.
    #[clap(
        long,
        env = "SIM_CONTROLD_ADVANCE_TIMEOUT",
        value_parser = parse_nonzero_duration,
        default_value = "60s"
    )]
    advance_timeout: Duration,
    /// How often to check on an advance.
    #[clap(
        long,
        env = "SIM_CONTROLD_ADVANCE_POLL_INTERVAL",
        value_parser = parse_nonzero_duration,
        default_value = "250ms"
    )]
    advance_poll_interval: Duration,
    /// How long to wait for a stop or start before reporting no reply.
    #[clap(
        long,
        env = "SIM_CONTROLD_COMMAND_TIMEOUT",
        value_parser = parse_nonzero_duration,
        default_value = "6s"
    )]
    command_timeout: Duration,
    /// How often to check on a stop or start.
    #[clap(
        long,
        env = "SIM_CONTROLD_COMMAND_POLL_INTERVAL",
        value_parser = parse_nonzero_duration,
        default_value = "100ms"
    )]
    command_poll_interval: Duration,
    /// Which tracing events to log to stderr.
    ///
    /// This value is a comma-separated list of filter directives, e.g.
    /// `info,sim_run_control=debug`.
    #[clap(
        long,
        env = "SIM_CONTROLD_LOG_FILTER",
        value_name = "FILTER",
        default_value = "info"
    )]
    log_filter: Targets,
    /// A prefix for every line logged to stderr.
    #[clap(long, env = "SIM_CONTROLD_LOG_PREFIX")]
    log_prefix: Option<String>,
}

fn parse_nonzero_duration(s: &str) -> Result<Duration, anyhow::Error> {
    let duration = humantime::parse_duration(s)?;
    if duration.is_zero() {
        anyhow::bail!("must be non-zero");
    }
    Ok(duration)
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args(CliConfig::default());
    if let Err(err) = run(args).await {
        eprintln!("sim-controld: fatal: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    sim_ore::tracing::configure(
        "sim-controld",
        StderrLogConfig {
            prefix: args.log_prefix,
            filter: args.log_filter,
        },
    )?;

    let mut addrs = tokio::net::lookup_host(&args.listen_addr)
        .await
        .with_context(|| format!("resolving {}", args.listen_addr))?;
    let addr = addrs
        .next()
        .with_context(|| format!("{} did not resolve to any addresses", args.listen_addr))?;

    let run_control = RunControlConfig::default()
        .with_advance_timing(args.advance_timeout, args.advance_poll_interval)
        .with_command_timing(args.command_timeout, args.command_poll_interval);

    let mut workers = Vec::new();
    let (store, bus): (Arc<dyn ControlStore>, Arc<dyn NotificationBus>) = if args.in_memory {
        let store: Arc<dyn ControlStore> = Arc::new(MemControlStore::new());
        let bus: Arc<dyn NotificationBus> = Arc::new(MemBus::new());
        let emulator = WorkerEmulator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            EmulatorBehavior::cooperative(args.emulated_step_duration),
        );
        for run in args.seed_runs {
            emulator.create_run(&run).await?;
            workers.push(emulator.serve(run.clone()).await?);
            info!(%run, "seeded emulated run");
        }
        (store, bus)
    } else {
        let url = args
            .redis_url
            .context("--redis-url is required unless --in-memory is set")?;
        let config = RedisConfig::new(url);
        let store: Arc<dyn ControlStore> = Arc::new(
            RedisControlStore::open(&config)
                .await
                .context("connecting control store")?,
        );
        let bus: Arc<dyn NotificationBus> = Arc::new(
            RedisBus::open(&config)
                .await
                .context("connecting notification bus")?,
        );
        info!("connected to redis");
        (store, bus)
    };

    let server = ControlServer::start(
        Some(&addr),
        ServerConfig {
            store,
            bus,
            run_control,
            metrics_registry: MetricsRegistry::new(),
        },
    )
    .await
    .with_context(|| format!("binding {}", addr))?;

    println!("sim-controld listening...");
    println!(" HTTP address: {}", server.base_url);

    tokio::select! {
        res = server.handle => {
            res?;
            anyhow::bail!("serving task unexpectedly exited");
        }
        () = shutdown_signal() => {
            info!("shutting down");
        }
    }
    for worker in workers {
        worker.abort();
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("received signal TERM"),
                _ = tokio::signal::ctrl_c() => info!("received signal INT"),
            }
        }
        Err(err) => {
            tracing::warn!("unable to listen for TERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn zero_timing_is_rejected() {
        let args = Args::try_parse_from(["sim-controld", "--in-memory"]).expect("valid args");
        assert_eq!(args.advance_poll_interval, Duration::from_millis(250));

        for flag in [
            "--advance-timeout",
            "--advance-poll-interval",
            "--command-timeout",
            "--command-poll-interval",
        ] {
            let res = Args::try_parse_from(["sim-controld", "--in-memory", flag, "0s"]);
            assert!(res.is_err(), "{flag} accepted zero");
        }
        let args = Args::try_parse_from(["sim-controld", "--in-memory", "--command-timeout", "2s"])
            .expect("valid args");
        assert_eq!(args.command_timeout, Duration::from_secs(2));
    }
}
