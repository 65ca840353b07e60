//! Local stand-ins for clients connected to other instances.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    Result,
    broker::{Broker, Client, RemoteClient},
    dispatcher::BridgeSender,
    instance::InstanceId,
    metrics::metrics,
    protocol::Message,
    registry::ClientRegistration,
};

struct Snapshot {
    registration: ClientRegistration,
    auth_record: Value,
}

/// A remote client registered in the local broker. `send` goes out over the
/// owning instance's direct channel instead of a socket.
pub struct BridgedClient {
    client_id: String,
    snapshot: RwLock<Snapshot>,
    discarded: AtomicBool,
    sender: Arc<dyn BridgeSender>,
}

impl BridgedClient {
    pub fn new(
        registration: ClientRegistration,
        auth_record: Value,
        sender: Arc<dyn BridgeSender>,
    ) -> Self {
        Self {
            client_id: registration.client_id.clone(),
            snapshot: RwLock::new(Snapshot {
                registration,
                auth_record,
            }),
            discarded: AtomicBool::new(false),
            sender,
        }
    }
}

#[async_trait]
impl Client for BridgedClient {
    fn id(&self) -> &str {
        &self.client_id
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.is_discarded() {
            debug!(client_id = %self.client_id, name = %message.name, "dropping send to discarded proxy");
            return Ok(());
        }
        let owner = self.owning_instance_id();
        self.sender
            .send_via_bridge(&owner, &self.client_id, &message)
            .await
    }

    fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    fn has_subscription(&self, topic: &str) -> bool {
        self.snapshot
            .read()
            .expect("proxy snapshot poisoned")
            .registration
            .has_subscription(topic)
    }

    fn as_remote(&self) -> Option<&dyn RemoteClient> {
        Some(self)
    }
}

impl RemoteClient for BridgedClient {
    fn owning_instance_id(&self) -> String {
        self.snapshot
            .read()
            .expect("proxy snapshot poisoned")
            .registration
            .instance_id
            .clone()
    }

    fn registration(&self) -> ClientRegistration {
        self.snapshot
            .read()
            .expect("proxy snapshot poisoned")
            .registration
            .clone()
    }

    fn auth_record(&self) -> Value {
        self.snapshot
            .read()
            .expect("proxy snapshot poisoned")
            .auth_record
            .clone()
    }

    fn receive_changes(&self, registration: ClientRegistration, auth_record: Value) {
        let mut snapshot = self.snapshot.write().expect("proxy snapshot poisoned");
        snapshot.registration = registration;
        snapshot.auth_record = auth_record;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    Created,
    Updated,
    /// The row belongs to this instance; its client is already local.
    SkippedOwn,
    /// A real local client already uses this id.
    SkippedLocal,
}

/// Find-or-create and removal of proxies in the local broker.
///
/// Shared by the shared-channel router and the reconciler; the guard keeps two
/// concurrent find-or-create calls for the same client from both registering.
pub struct ProxyRegistry {
    self_id: InstanceId,
    broker: Arc<dyn Broker>,
    sender: Arc<dyn BridgeSender>,
    guard: Mutex<()>,
}

impl ProxyRegistry {
    pub fn new(broker: Arc<dyn Broker>, sender: Arc<dyn BridgeSender>) -> Self {
        Self {
            self_id: sender.self_instance_id().clone(),
            broker,
            sender,
            guard: Mutex::new(()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn mirror(&self, registration: ClientRegistration, auth_record: Value) -> MirrorOutcome {
        if self.self_id == registration.instance_id {
            debug!(client_id = %registration.client_id, "registration owned by this instance; not proxying");
            return MirrorOutcome::SkippedOwn;
        }

        let _guard = self.guard.lock().expect("proxy registry poisoned");
        let existing = self.broker.client_by_id(&registration.client_id).ok();
        if let Some(existing) = &existing {
            match existing.as_remote() {
                Some(remote) if !existing.is_discarded() => {
                    remote.receive_changes(registration, auth_record);
                    return MirrorOutcome::Updated;
                }
                Some(_) => {}
                None => {
                    warn!(
                        client_id = %registration.client_id,
                        owner = %registration.instance_id,
                        "remote registration collides with a local client; ignoring"
                    );
                    return MirrorOutcome::SkippedLocal;
                }
            }
        }

        // The host may register a real client under this id at any moment; only
        // replace exactly what was looked up above.
        let client_id = registration.client_id.clone();
        let owner = registration.instance_id.clone();
        let proxy: Arc<dyn Client> = Arc::new(BridgedClient::new(
            registration,
            auth_record,
            self.sender.clone(),
        ));
        if !self.broker.compare_and_register(proxy, existing.as_ref()) {
            warn!(client_id = %client_id, owner = %owner, "local client registered concurrently; not proxying");
            return MirrorOutcome::SkippedLocal;
        }
        metrics()
            .proxies_registered_total
            .fetch_add(1, Ordering::Relaxed);
        debug!(client_id = %client_id, owner = %owner, "registered bridged client");
        MirrorOutcome::Created
    }

    /// Unregister the proxy for `client_id`. Real local clients are left alone.
    pub fn remove(&self, client_id: &str) -> bool {
        let _guard = self.guard.lock().expect("proxy registry poisoned");
        self.remove_locked(client_id)
    }

    fn remove_locked(&self, client_id: &str) -> bool {
        let Ok(client) = self.broker.client_by_id(client_id) else {
            return false;
        };
        if client.as_remote().is_none() {
            return false;
        }
        if !self.broker.compare_and_unregister(client_id, &client) {
            debug!(client_id, "bridged client replaced concurrently; leaving it");
            return false;
        }
        metrics()
            .proxies_unregistered_total
            .fetch_add(1, Ordering::Relaxed);
        debug!(client_id, "unregistered bridged client");
        true
    }

    /// Unregister every proxy owned by `instance_id`.
    pub fn remove_instance(&self, instance_id: &str) -> usize {
        let _guard = self.guard.lock().expect("proxy registry poisoned");
        let owned: Vec<String> = self
            .proxies()
            .into_iter()
            .filter(|(_, owner)| owner == instance_id)
            .map(|(id, _)| id)
            .collect();
        owned.iter().filter(|id| self.remove_locked(id)).count()
    }

    /// Unregister every proxy whose id is not in `keep`.
    pub fn retain(&self, keep: &HashSet<String>) -> usize {
        let _guard = self.guard.lock().expect("proxy registry poisoned");
        let stale: Vec<String> = self
            .proxies()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !keep.contains(id))
            .collect();
        stale.iter().filter(|id| self.remove_locked(id)).count()
    }

    /// Current snapshot of a mirrored client, if there is one.
    pub fn lookup(&self, client_id: &str) -> Option<(ClientRegistration, Value)> {
        let client = self.broker.client_by_id(client_id).ok()?;
        let remote = client.as_remote()?;
        Some((remote.registration(), remote.auth_record()))
    }

    pub fn mirrored_ids(&self) -> BTreeSet<String> {
        self.proxies().into_iter().map(|(id, _)| id).collect()
    }

    /// `(client id, owning instance)` for every live proxy in the broker.
    fn proxies(&self) -> Vec<(String, String)> {
        self.broker
            .clients()
            .into_iter()
            .filter(|client| !client.is_discarded())
            .filter_map(|client| {
                client
                    .as_remote()
                    .map(|remote| (client.id().to_string(), remote.owning_instance_id()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::testing::{RecordingClient, RecordingSender};
    use serde_json::json;

    fn setup() -> (Arc<MemoryBroker>, Arc<RecordingSender>, ProxyRegistry) {
        let broker = Arc::new(MemoryBroker::new());
        let sender = Arc::new(RecordingSender::new(InstanceId::parse("rc_b")));
        let registry = ProxyRegistry::new(broker.clone(), sender.clone());
        (broker, sender, registry)
    }

    fn remote(client: &str, owner: &str) -> ClientRegistration {
        ClientRegistration::new(client, owner).with_subscriptions(["records/demo"])
    }

    #[tokio::test]
    async fn proxy_send_goes_to_owner() {
        let (broker, sender, registry) = setup();
        assert_eq!(
            registry.mirror(remote("x", "rc_a"), json!(null)),
            MirrorOutcome::Created
        );

        let proxy = broker.client_by_id("x").unwrap();
        assert!(proxy.has_subscription("records/demo"));
        proxy.send(Message::new("records/demo", "{\"id\":1}")).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "rc_a");
        assert_eq!(sent[0].1, "x");
        assert_eq!(sent[0].2.data, b"{\"id\":1}");
    }

    #[tokio::test]
    async fn mirror_updates_in_place() {
        let (broker, _, registry) = setup();
        registry.mirror(remote("x", "rc_a"), json!(null));
        let first = broker.client_by_id("x").unwrap();

        let moved = ClientRegistration::new("x", "rc_c").with_subscriptions(["records/other"]);
        assert_eq!(
            registry.mirror(moved, json!({"id": "u1"})),
            MirrorOutcome::Updated
        );
        let same = broker.client_by_id("x").unwrap();
        assert!(Arc::ptr_eq(&first, &same));
        assert!(!same.has_subscription("records/demo"));
        assert_eq!(same.as_remote().unwrap().owning_instance_id(), "rc_c");
        assert_eq!(same.as_remote().unwrap().auth_record(), json!({"id": "u1"}));
    }

    #[test]
    fn own_rows_are_never_proxied() {
        let (broker, _, registry) = setup();
        assert_eq!(
            registry.mirror(remote("x", "rc_b"), json!(null)),
            MirrorOutcome::SkippedOwn
        );
        assert!(broker.is_empty());
    }

    #[test]
    fn local_clients_are_not_touched() {
        let (broker, _, registry) = setup();
        broker.register(Arc::new(RecordingClient::new("x", ["a"])));
        assert_eq!(
            registry.mirror(remote("x", "rc_a"), json!(null)),
            MirrorOutcome::SkippedLocal
        );
        assert!(!registry.remove("x"));
        assert!(broker.client_by_id("x").unwrap().as_remote().is_none());
    }

    #[test]
    fn remove_instance_and_retain() {
        let (broker, _, registry) = setup();
        registry.mirror(remote("x1", "rc_a"), json!(null));
        registry.mirror(remote("x2", "rc_a"), json!(null));
        registry.mirror(remote("y1", "rc_c"), json!(null));
        broker.register(Arc::new(RecordingClient::new("local", ["a"])));

        assert_eq!(registry.remove_instance("rc_a"), 2);
        assert_eq!(
            registry.mirrored_ids(),
            BTreeSet::from(["y1".to_string()])
        );

        let keep = HashSet::new();
        assert_eq!(registry.retain(&keep), 1);
        assert!(registry.mirrored_ids().is_empty());
        assert!(broker.client_by_id("local").is_ok());
    }

    /// Lets a host-side registration land between the registry's lookup and
    /// its register/unregister.
    struct InterleavingBroker {
        inner: MemoryBroker,
        pending: Mutex<Option<Arc<dyn Client>>>,
    }

    impl InterleavingBroker {
        fn new() -> Self {
            Self {
                inner: MemoryBroker::new(),
                pending: Mutex::new(None),
            }
        }

        fn register_after_next_lookup(&self, client: Arc<dyn Client>) {
            *self.pending.lock().unwrap() = Some(client);
        }
    }

    impl Broker for InterleavingBroker {
        fn register(&self, client: Arc<dyn Client>) {
            self.inner.register(client)
        }

        fn unregister(&self, client_id: &str) -> Option<Arc<dyn Client>> {
            self.inner.unregister(client_id)
        }

        fn compare_and_register(
            &self,
            client: Arc<dyn Client>,
            expected: Option<&Arc<dyn Client>>,
        ) -> bool {
            self.inner.compare_and_register(client, expected)
        }

        fn compare_and_unregister(&self, client_id: &str, expected: &Arc<dyn Client>) -> bool {
            self.inner.compare_and_unregister(client_id, expected)
        }

        fn client_by_id(&self, client_id: &str) -> Result<Arc<dyn Client>> {
            let seen = self.inner.client_by_id(client_id);
            if let Some(client) = self.pending.lock().unwrap().take() {
                self.inner.register(client);
            }
            seen
        }

        fn clients(&self) -> Vec<Arc<dyn Client>> {
            self.inner.clients()
        }
    }

    fn interleaving_setup() -> (Arc<InterleavingBroker>, ProxyRegistry) {
        let broker = Arc::new(InterleavingBroker::new());
        let sender = Arc::new(RecordingSender::new(InstanceId::parse("rc_b")));
        let registry = ProxyRegistry::new(broker.clone(), sender);
        (broker, registry)
    }

    #[test]
    fn concurrent_local_registration_wins_over_new_proxy() {
        let (broker, registry) = interleaving_setup();
        let local = Arc::new(RecordingClient::new("x", ["a"]));
        broker.register_after_next_lookup(local.clone());

        assert_eq!(
            registry.mirror(remote("x", "rc_a"), json!(null)),
            MirrorOutcome::SkippedLocal
        );
        assert!(!local.is_discarded());
        assert!(broker.client_by_id("x").unwrap().as_remote().is_none());
    }

    #[test]
    fn concurrent_local_registration_survives_proxy_removal() {
        let (broker, registry) = interleaving_setup();
        registry.mirror(remote("x", "rc_a"), json!(null));
        let local = Arc::new(RecordingClient::new("x", ["a"]));
        broker.register_after_next_lookup(local.clone());

        assert!(!registry.remove("x"));
        assert!(!local.is_discarded());
        assert!(broker.client_by_id("x").unwrap().as_remote().is_none());
    }

    #[tokio::test]
    async fn discarded_proxy_does_not_send() {
        let (broker, sender, registry) = setup();
        registry.mirror(remote("x", "rc_a"), json!(null));
        let proxy = broker.client_by_id("x").unwrap();
        registry.remove("x");
        assert!(proxy.is_discarded());
        proxy.send(Message::new("m", "d")).await.unwrap();
        assert!(sender.sent().is_empty());
    }
}
