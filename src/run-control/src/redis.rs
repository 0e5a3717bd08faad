// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Implementations of [`ControlStore`] and [`NotificationBus`] backed by Redis.
//!
//! A run's state lives in the Redis hash named after the run; its topic is the
//! pub/sub channel of the same name.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use tracing::warn;

use crate::location::{CaSResult, ControlStore, ExternalError, NotificationBus, Subscription};
use crate::{ControlState, CorrelationId, RunId, CONTROL_FIELD};

/// Sets `ARGV[1]` of hash `KEYS[1]` to `ARGV[3]` iff it currently holds
/// `ARGV[2]`, where the empty string stands for a missing field.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == false then
    current = ''
end
if current ~= ARGV[2] then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
"#;

/// Configuration for opening a Redis-backed store or bus.
#[derive(Clone)]
pub struct RedisConfig {
    url: String,
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The url may carry a password.
        f.debug_struct("RedisConfig").finish_non_exhaustive()
    }
}

impl RedisConfig {
    /// The environment variable naming the Redis server external tests run
    /// against.
    pub const EXTERNAL_TESTS_REDIS_URL: &'static str = "REDIS_URL";

    /// Returns a new [RedisConfig] for the server at `url`, e.g.
    /// `redis://localhost:6379`.
    pub fn new(url: impl Into<String>) -> Self {
        RedisConfig { url: url.into() }
    }

    /// Returns a new [RedisConfig] for use in unit tests.
    ///
    /// By default, Redis tests are no-ops so that `cargo test` works without
    /// a Redis server. Set the `REDIS_URL` environment variable to run them.
    pub fn new_for_test() -> Option<Self> {
        let url = std::env::var(Self::EXTERNAL_TESTS_REDIS_URL).ok()?;
        Some(RedisConfig::new(url))
    }

    fn client(&self) -> Result<redis::Client, RedisError> {
        redis::Client::open(self.url.as_str())
    }
}

fn store_err(err: RedisError) -> ExternalError {
    ExternalError::Store(err.into())
}

fn bus_err(err: RedisError) -> ExternalError {
    ExternalError::Bus(err.into())
}

/// A [`ControlStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisControlStore {
    conn: MultiplexedConnection,
    compare_and_set: Arc<Script>,
}

impl fmt::Debug for RedisControlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisControlStore").finish_non_exhaustive()
    }
}

impl RedisControlStore {
    /// Connects to the configured server.
    pub async fn open(config: &RedisConfig) -> Result<Self, ExternalError> {
        let client = config.client().map_err(store_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        Ok(RedisControlStore {
            conn,
            compare_and_set: Arc::new(Script::new(COMPARE_AND_SET_SCRIPT)),
        })
    }
}

#[async_trait]
impl ControlStore for RedisControlStore {
    async fn control(&self, run: &RunId) -> Result<Option<ControlState>, ExternalError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(run.as_str(), CONTROL_FIELD)
            .await
            .map_err(store_err)?;
        raw.map(|raw| {
            raw.parse()
                .map_err(|e: String| ExternalError::Store(anyhow!(e)))
        })
        .transpose()
    }

    async fn set_control(&self, run: &RunId, state: ControlState) -> Result<(), ExternalError> {
        let mut conn = self.conn.clone();
        let () = conn
            .hset(run.as_str(), CONTROL_FIELD, state.as_str())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn compare_and_set_control(
        &self,
        run: &RunId,
        expected: Option<ControlState>,
        new: ControlState,
    ) -> Result<CaSResult, ExternalError> {
        let mut conn = self.conn.clone();
        let committed: i64 = self
            .compare_and_set
            .key(run.as_str())
            .arg(CONTROL_FIELD)
            .arg(expected.map_or("", |state| state.as_str()))
            .arg(new.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if committed == 1 {
            Ok(CaSResult::Committed)
        } else {
            Ok(CaSResult::ExpectationMismatch)
        }
    }

    async fn reply(
        &self,
        run: &RunId,
        id: &CorrelationId,
    ) -> Result<Option<String>, ExternalError> {
        let mut conn = self.conn.clone();
        conn.hget(run.as_str(), id.to_string())
            .await
            .map_err(store_err)
    }

    async fn set_reply(
        &self,
        run: &RunId,
        id: &CorrelationId,
        reply: &str,
    ) -> Result<(), ExternalError> {
        let mut conn = self.conn.clone();
        let () = conn
            .hset(run.as_str(), id.to_string(), reply)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// A [`NotificationBus`] over Redis pub/sub.
///
/// Publishes share one multiplexed connection; every [`Subscription`] owns a
/// dedicated pub/sub connection, closed when the subscription is dropped.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

impl RedisBus {
    /// Connects to the configured server.
    pub async fn open(config: &RedisConfig) -> Result<Self, ExternalError> {
        let client = config.client().map_err(bus_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(bus_err)?;
        Ok(RedisBus { client, conn })
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn publish(&self, topic: &RunId, payload: String) -> Result<(), ExternalError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn
            .publish(topic.as_str(), payload)
            .await
            .map_err(bus_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &RunId) -> Result<Subscription, ExternalError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(bus_err)?;
        pubsub.subscribe(topic.as_str()).await.map_err(bus_err)?;
        let channel = topic.clone();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(run = %channel, "dropping undecodable message: {err}");
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(Subscription::new(topic.clone(), messages))
    }
}
