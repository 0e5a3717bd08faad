// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementations for testing and local development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::location::{CaSResult, ControlStore, ExternalError, NotificationBus, Subscription};
use crate::{ControlState, CorrelationId, RunId, CONTROL_FIELD};

/// How many undelivered messages a lagging subscriber may accumulate before
/// it starts missing them.
const MEM_BUS_CAPACITY: usize = 1024;

#[derive(Debug)]
struct MemControlStoreCore {
    hashes: BTreeMap<RunId, BTreeMap<String, String>>,
    available: bool,
}

impl MemControlStoreCore {
    fn get(&self, run: &RunId, field: &str) -> Option<&String> {
        self.hashes.get(run).and_then(|hash| hash.get(field))
    }

    fn set(&mut self, run: &RunId, field: &str, value: String) {
        self.hashes
            .entry(run.clone())
            .or_default()
            .insert(field.to_owned(), value);
    }

    fn control(&self, run: &RunId) -> Result<Option<ControlState>, ExternalError> {
        self.get(run, CONTROL_FIELD)
            .map(|raw| raw.parse().map_err(|e: String| ExternalError::Store(anyhow!(e))))
            .transpose()
    }
}

/// An in-memory implementation of [`ControlStore`].
///
/// Clones share the same underlying data.
#[derive(Debug, Clone)]
pub struct MemControlStore {
    core: Arc<Mutex<MemControlStoreCore>>,
}

impl Default for MemControlStore {
    fn default() -> Self {
        MemControlStore::new()
    }
}

impl MemControlStore {
    /// Constructs a new, empty store.
    pub fn new() -> Self {
        MemControlStore {
            core: Arc::new(Mutex::new(MemControlStoreCore {
                hashes: BTreeMap::new(),
                available: true,
            })),
        }
    }

    /// Makes every subsequent operation fail (or succeed again), as if the
    /// store had become unreachable.
    pub fn set_available(&self, available: bool) {
        self.core.lock().expect("lock poisoned").available = available;
    }

    /// Returns a copy of every field of the run's hash.
    pub fn hash(&self, run: &RunId) -> BTreeMap<String, String> {
        let core = self.core.lock().expect("lock poisoned");
        core.hashes.get(run).cloned().unwrap_or_default()
    }

    fn core_lock(&self) -> Result<MutexGuard<'_, MemControlStoreCore>, ExternalError> {
        let core = self
            .core
            .lock()
            .map_err(|e| ExternalError::Store(anyhow!("poison: {}", e)))?;
        if !core.available {
            return Err(ExternalError::Store(anyhow!("control store unavailable")));
        }
        Ok(core)
    }
}

#[async_trait]
impl ControlStore for MemControlStore {
    async fn control(&self, run: &RunId) -> Result<Option<ControlState>, ExternalError> {
        self.core_lock()?.control(run)
    }

    async fn set_control(&self, run: &RunId, state: ControlState) -> Result<(), ExternalError> {
        self.core_lock()?
            .set(run, CONTROL_FIELD, state.as_str().to_owned());
        Ok(())
    }

    async fn compare_and_set_control(
        &self,
        run: &RunId,
        expected: Option<ControlState>,
        new: ControlState,
    ) -> Result<CaSResult, ExternalError> {
        // The lock is held across the comparison and the write.
        let mut core = self.core_lock()?;
        if core.control(run)? != expected {
            return Ok(CaSResult::ExpectationMismatch);
        }
        core.set(run, CONTROL_FIELD, new.as_str().to_owned());
        Ok(CaSResult::Committed)
    }

    async fn reply(
        &self,
        run: &RunId,
        id: &CorrelationId,
    ) -> Result<Option<String>, ExternalError> {
        Ok(self.core_lock()?.get(run, &id.to_string()).cloned())
    }

    async fn set_reply(
        &self,
        run: &RunId,
        id: &CorrelationId,
        reply: &str,
    ) -> Result<(), ExternalError> {
        self.core_lock()?.set(run, &id.to_string(), reply.to_owned());
        Ok(())
    }
}

#[derive(Debug)]
struct MemBusCore {
    topics: BTreeMap<RunId, broadcast::Sender<String>>,
    published: BTreeMap<RunId, Vec<String>>,
    available: bool,
}

impl MemBusCore {
    fn sender(&mut self, topic: &RunId) -> &broadcast::Sender<String> {
        self.topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(MEM_BUS_CAPACITY).0)
    }
}

/// An in-memory implementation of [`NotificationBus`].
///
/// Clones share the same topics.
#[derive(Debug, Clone)]
pub struct MemBus {
    core: Arc<Mutex<MemBusCore>>,
}

impl Default for MemBus {
    fn default() -> Self {
        MemBus::new()
    }
}

impl MemBus {
    /// Constructs a new bus without any subscribers.
    pub fn new() -> Self {
        MemBus {
            core: Arc::new(Mutex::new(MemBusCore {
                topics: BTreeMap::new(),
                published: BTreeMap::new(),
                available: true,
            })),
        }
    }

    /// Makes every subsequent operation fail (or succeed again), as if the
    /// bus had become unreachable.
    pub fn set_available(&self, available: bool) {
        self.core.lock().expect("lock poisoned").available = available;
    }

    /// The number of live subscriptions to `topic`.
    pub fn subscriber_count(&self, topic: &RunId) -> usize {
        let core = self.core.lock().expect("lock poisoned");
        core.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Every payload published to `topic` so far, in order.
    pub fn published(&self, topic: &RunId) -> Vec<String> {
        let core = self.core.lock().expect("lock poisoned");
        core.published.get(topic).cloned().unwrap_or_default()
    }

    fn core_lock(&self) -> Result<MutexGuard<'_, MemBusCore>, ExternalError> {
        let core = self
            .core
            .lock()
            .map_err(|e| ExternalError::Bus(anyhow!("poison: {}", e)))?;
        if !core.available {
            return Err(ExternalError::Bus(anyhow!("notification bus unavailable")));
        }
        Ok(core)
    }
}

#[async_trait]
impl NotificationBus for MemBus {
    async fn publish(&self, topic: &RunId, payload: String) -> Result<(), ExternalError> {
        let mut core = self.core_lock()?;
        core.published
            .entry(topic.clone())
            .or_default()
            .push(payload.clone());
        // An error only means nobody is listening.
        let _ = core.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &RunId) -> Result<Subscription, ExternalError> {
        let receiver = self.core_lock()?.sender(topic).subscribe();
        let messages = BroadcastStream::new(receiver)
            .filter_map(|message| futures::future::ready(message.ok()));
        Ok(Subscription::new(topic.clone(), messages))
    }
}

#[cfg(test)]
mod tests {
    use crate::location::tests::{bus_impl_test, control_store_impl_test};

    use super::*;

    #[tokio::test]
    async fn mem_control_store() -> Result<(), ExternalError> {
        let store = MemControlStore::new();
        control_store_impl_test(|| futures::future::ready(Ok(store.clone()))).await
    }

    #[tokio::test]
    async fn mem_bus() -> Result<(), ExternalError> {
        let bus = MemBus::new();
        bus_impl_test(|| futures::future::ready(Ok(bus.clone()))).await
    }

    #[tokio::test]
    async fn mem_bus_tracks_subscriptions() -> Result<(), ExternalError> {
        let bus = MemBus::new();
        let run: RunId = "site-1".parse().expect("valid");
        assert_eq!(bus.subscriber_count(&run), 0);

        let a = bus.subscribe(&run).await?;
        let b = bus.subscribe(&run).await?;
        assert_eq!(bus.subscriber_count(&run), 2);
        drop(a);
        assert_eq!(bus.subscriber_count(&run), 1);
        drop(b);
        assert_eq!(bus.subscriber_count(&run), 0);

        bus.publish(&run, "complete".into()).await?;
        assert_eq!(bus.published(&run), vec!["complete".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable() -> Result<(), ExternalError> {
        let store = MemControlStore::new();
        let bus = MemBus::new();
        let run: RunId = "site-1".parse().expect("valid");

        store.set_available(false);
        bus.set_available(false);
        assert!(matches!(
            store.control(&run).await,
            Err(ExternalError::Store(_))
        ));
        assert!(matches!(
            bus.publish(&run, "x".into()).await,
            Err(ExternalError::Bus(_))
        ));
        assert!(matches!(bus.subscribe(&run).await, Err(ExternalError::Bus(_))));

        store.set_available(true);
        bus.set_available(true);
        store.set_control(&run, ControlState::Idle).await?;
        assert_eq!(store.control(&run).await?, Some(ControlState::Idle));
        assert_eq!(store.hash(&run).get(CONTROL_FIELD).map(String::as_str), Some("idle"));
        Ok(())
    }
}
