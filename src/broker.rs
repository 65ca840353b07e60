//! Capabilities the bridge consumes from its host: the local realtime broker,
//! its clients, and the cache/auth collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Error, Result, protocol::Message, registry::ClientRegistration};

/// A realtime client as seen by the local broker.
#[async_trait]
pub trait Client: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, message: Message) -> Result<()>;

    fn is_discarded(&self) -> bool;

    fn discard(&self);

    fn has_subscription(&self, topic: &str) -> bool;

    /// `Some` for clients physically connected to another instance.
    fn as_remote(&self) -> Option<&dyn RemoteClient> {
        None
    }
}

/// Extra surface of a client mirrored from another instance.
pub trait RemoteClient: Send + Sync {
    fn owning_instance_id(&self) -> String;

    fn registration(&self) -> ClientRegistration;

    fn auth_record(&self) -> Value;

    /// Replace the mirrored snapshot in one step.
    fn receive_changes(&self, registration: ClientRegistration, auth_record: Value);
}

/// The local pub/sub broker. Implementations provide their own locking.
pub trait Broker: Send + Sync {
    fn register(&self, client: Arc<dyn Client>);

    fn unregister(&self, client_id: &str) -> Option<Arc<dyn Client>>;

    /// Register `client` only if the slot for its id still holds `expected`
    /// (`None`: the slot is empty). A replaced client is discarded.
    fn compare_and_register(
        &self,
        client: Arc<dyn Client>,
        expected: Option<&Arc<dyn Client>>,
    ) -> bool;

    /// Unregister `client_id` only if it still maps to `expected`.
    fn compare_and_unregister(&self, client_id: &str, expected: &Arc<dyn Client>) -> bool;

    fn client_by_id(&self, client_id: &str) -> Result<Arc<dyn Client>>;

    fn clients(&self) -> Vec<Arc<dyn Client>>;
}

#[async_trait]
pub trait CacheReloader: Send + Sync {
    async fn reload_collections(&self) -> Result<()>;

    async fn reload_settings(&self) -> Result<()>;
}

/// For hosts without cached collections or settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheReloader for NoopCache {
    async fn reload_collections(&self) -> Result<()> {
        Ok(())
    }

    async fn reload_settings(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves an auth record from the refs stored in `client_registrations`.
#[async_trait]
pub trait AuthRecordLoader: Send + Sync {
    async fn load(&self, collection_ref: &str, record_ref: &str) -> Result<Option<Value>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthRecords;

#[async_trait]
impl AuthRecordLoader for NoAuthRecords {
    async fn load(&self, _collection_ref: &str, _record_ref: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// In-process broker backed by a concurrent map.
#[derive(Default)]
pub struct MemoryBroker {
    clients: DashMap<String, Arc<dyn Client>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send to every live client subscribed to `topic`; bridged proxies forward
    /// to their owning instance. Returns how many clients accepted the message.
    pub async fn broadcast(&self, topic: &str, message: &Message) -> usize {
        let mut delivered = 0;
        for client in self.clients() {
            if client.is_discarded() || !client.has_subscription(topic) {
                continue;
            }
            match client.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(client_id = client.id(), topic, error = %err, "broadcast send failed")
                }
            }
        }
        delivered
    }
}

impl Broker for MemoryBroker {
    fn register(&self, client: Arc<dyn Client>) {
        let id = client.id().to_string();
        if let Some(previous) = self.clients.insert(id.clone(), client.clone())
            && !Arc::ptr_eq(&previous, &client)
        {
            previous.discard();
        }
        debug!(client_id = %id, "client registered");
    }

    fn unregister(&self, client_id: &str) -> Option<Arc<dyn Client>> {
        let (_, client) = self.clients.remove(client_id)?;
        client.discard();
        debug!(client_id, "client unregistered");
        Some(client)
    }

    fn compare_and_register(
        &self,
        client: Arc<dyn Client>,
        expected: Option<&Arc<dyn Client>>,
    ) -> bool {
        match self.clients.entry(client.id().to_string()) {
            Entry::Occupied(mut slot) => {
                let matches = expected.is_some_and(|expected| Arc::ptr_eq(slot.get(), expected));
                if !matches {
                    return false;
                }
                let previous = slot.insert(client);
                previous.discard();
            }
            Entry::Vacant(slot) => {
                if expected.is_some() {
                    debug!(client_id = %slot.key(), "expected client already gone; registering anyway");
                }
                slot.insert(client);
            }
        }
        true
    }

    fn compare_and_unregister(&self, client_id: &str, expected: &Arc<dyn Client>) -> bool {
        match self
            .clients
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, expected))
        {
            Some((_, client)) => {
                client.discard();
                debug!(client_id, "client unregistered");
                true
            }
            None => false,
        }
    }

    fn client_by_id(&self, client_id: &str) -> Result<Arc<dyn Client>> {
        self.clients
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ClientNotFound(client_id.to_string()))
    }

    fn clients(&self) -> Vec<Arc<dyn Client>> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
