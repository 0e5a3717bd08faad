// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Integration tests for the run control HTTP API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use sim_controld::{ControlServer, ServerConfig};
use sim_ore::metrics::MetricsRegistry;
use sim_run_control::cfg::RunControlConfig;
use sim_run_control::emulator::{EmulatorBehavior, WorkerEmulator};
use sim_run_control::location::ControlStore;
use sim_run_control::mem::{MemBus, MemControlStore};
use sim_run_control::{ControlState, RunId};

struct TestServer {
    server: ControlServer,
    store: MemControlStore,
    emulator: WorkerEmulator,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(behavior: EmulatorBehavior, runs: &[&str]) -> TestServer {
        let store = MemControlStore::new();
        let bus = MemBus::new();
        let emulator = WorkerEmulator::new(Arc::new(store.clone()), Arc::new(bus.clone()), behavior);
        for run in runs {
            let run: RunId = run.parse().expect("valid run id");
            emulator.create_run(&run).await.expect("run created");
            let _ = emulator.serve(run).await.expect("serving");
        }
        let run_control = RunControlConfig::default()
            .with_advance_timing(Duration::from_secs(2), Duration::from_millis(50))
            .with_command_timing(Duration::from_secs(1), Duration::from_millis(50));
        let server = ControlServer::start(
            None,
            ServerConfig {
                store: Arc::new(store.clone()),
                bus: Arc::new(bus),
                run_control,
                metrics_registry: MetricsRegistry::new(),
            },
        )
        .await
        .expect("server started");
        TestServer {
            server,
            store,
            emulator,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.base_url, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request sent")
    }
}

fn fast() -> EmulatorBehavior {
    EmulatorBehavior::cooperative(Duration::from_millis(100))
}

#[tokio::test(flavor = "multi_thread")]
async fn advance_batch() {
    let t = TestServer::start(fast(), &["a", "b"]).await;

    let res = t.post("/api/runs/advance", json!({"run_ids": ["a", "b"]})).await;

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.expect("json body");
    let body = body.as_object().expect("outcome map");
    assert_eq!(body.len(), 2);
    // Resolved by whichever of the reply or the notification was seen first.
    assert_eq!(body["a"]["status"], json!(true));
    assert_eq!(body["b"]["status"], json!(true));
    assert_eq!(t.emulator.handled().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn advance_busy_run() {
    let t = TestServer::start(fast(), &["a"]).await;
    let a: RunId = "a".parse().expect("valid");
    t.store
        .set_control(&a, ControlState::Running)
        .await
        .expect("control written");

    let res = t.post("/api/runs/a/advance", json!({})).await;

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.expect("json body");
    assert_eq!(body, json!({"status": true, "message": "busy"}));
    assert!(t.emulator.handled().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn advance_without_reply() {
    let t = TestServer::start(EmulatorBehavior::silent(), &["a", "b"]).await;

    let res = t.post("/api/runs/advance", json!({"run_ids": ["a", "b"]})).await;

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.expect("json body");
    assert_eq!(
        body["a"],
        json!({"status": false, "message": "no simulation reply"})
    );
    assert_eq!(body["b"]["status"], json!(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn advance_rejects_bad_input() {
    let t = TestServer::start(fast(), &["a"]).await;

    let res = t.post("/api/runs/advance", json!({"run_ids": []})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = t.post("/api/runs/advance", json!({"run_ids": ["a", ""]})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = t
        .post("/api/runs/advance", json!({"run_ids": ["a", "missing"]}))
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(t.emulator.handled().is_empty(), "nothing was advanced");

    let res = t.post("/api/runs/missing/stop", json!({})).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_and_start() {
    let t = TestServer::start(fast(), &["a"]).await;

    let res = t
        .post(
            "/api/runs/a/start",
            json!({"start_datetime": "2025-01-01 00:00:00", "external_clock": true}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = t.post("/api/runs/a/stop", json!({})).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let methods: Vec<_> = t
        .emulator
        .handled()
        .into_iter()
        .map(|(_, envelope)| envelope.method)
        .collect();
    assert_eq!(methods, vec!["start", "stop"]);
    let (_, start) = &t.emulator.handled()[0];
    assert_eq!(
        start.data,
        Some(json!({
            "start_datetime": "2025-01-01 00:00:00",
            "realtime": false,
            "external_clock": true,
        }))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_stop() {
    let t = TestServer::start(fast().failing("worker crashed"), &["a"]).await;

    let res = t.post("/api/runs/a/stop", json!({})).await;

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.expect("json body");
    assert_eq!(body["status"], json!(false));
    let reply: serde_json::Value =
        serde_json::from_str(body["message"].as_str().expect("raw reply")).expect("json reply");
    assert_eq!(reply["reason"], "worker crashed");
}

#[tokio::test(flavor = "multi_thread")]
async fn store_unavailable() {
    let t = TestServer::start(fast(), &["a"]).await;
    t.store.set_available(false);

    let res = t.post("/api/runs/advance", json!({"run_ids": ["a"]})).await;

    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread")]
async fn livez_and_metrics() {
    let t = TestServer::start(fast(), &["a"]).await;

    let res = t
        .client
        .get(t.url("/api/livez"))
        .send()
        .await
        .expect("request sent");
    assert_eq!(res.status(), StatusCode::OK);

    let res = t.post("/api/runs/a/advance", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = t
        .client
        .get(t.url("/metrics"))
        .send()
        .await
        .expect("request sent");
    assert_eq!(res.status(), StatusCode::OK);
    let text = res.text().await.expect("text body");
    assert!(
        text.contains(r#"sim_run_control_requests_started{method="advance"} 1"#),
        "{text}"
    );
    assert!(text.contains("sim_run_control_inflight_requests 0"), "{text}");
}

#[tokio::test]
async fn zero_poll_interval_is_rejected() {
    let store = MemControlStore::new();
    let run_control = RunControlConfig::default()
        .with_advance_timing(Duration::from_secs(2), Duration::ZERO);
    let res = ControlServer::start(
        None,
        ServerConfig {
            store: Arc::new(store),
            bus: Arc::new(MemBus::new()),
            run_control,
            metrics_registry: MetricsRegistry::new(),
        },
    )
    .await;

    let err = res.expect_err("zero poll interval");
    assert_eq!(
        format!("{err:#}"),
        "invalid run control configuration: advance: poll interval must be non-zero"
    );
}
