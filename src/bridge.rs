//! Wiring and lifecycle of one instance's realtime bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    Error, Result,
    alarm::ProtocolAlarm,
    broadcast::ChangeBroadcaster,
    broker::{AuthRecordLoader, Broker, CacheReloader, Client, MemoryBroker, NoAuthRecords, NoopCache},
    config::BridgeConfig,
    direct::DirectRouter,
    dispatcher::Dispatcher,
    heartbeat::Heartbeat,
    instance::InstanceId,
    lease::LeaseStore,
    protocol::Message,
    proxy::ProxyRegistry,
    pubsub::{NotificationHandler, NotificationListener},
    reconcile::Reconciler,
    registry::{ClientRegistration, LocalRegistry, RegistrationStore},
    schema::{SchemaConfig, SchemaManager},
    shared::SharedRouter,
};

pub struct RealtimeBridgeBuilder {
    pool: PgPool,
    broker: Option<Arc<dyn Broker>>,
    cache: Arc<dyn CacheReloader>,
    auth: Arc<dyn AuthRecordLoader>,
    config: BridgeConfig,
}

impl RealtimeBridgeBuilder {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            broker: None,
            cache: Arc::new(NoopCache),
            auth: Arc::new(NoAuthRecords),
            config: BridgeConfig::default(),
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheReloader>) -> Self {
        self.cache = cache;
        self
    }

    pub fn auth_loader(mut self, auth: Arc<dyn AuthRecordLoader>) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn start(self) -> Result<BridgeHandle> {
        self.build()?.start().await
    }

    pub fn build(self) -> Result<RealtimeBridge> {
        self.config.validate()?;
        let self_id = self
            .config
            .instance_id
            .clone()
            .unwrap_or_else(InstanceId::generate);
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn Broker>);
        let dispatcher = Arc::new(Dispatcher::new(self.pool.clone(), self_id.clone()));
        let schema = self.config.schema.as_str();
        let registrations = RegistrationStore::new(
            self.pool.clone(),
            schema,
            self.config.shared_channel.clone(),
            self_id.clone(),
        );
        Ok(RealtimeBridge {
            local: Arc::new(LocalRegistry::new(registrations.clone())),
            registrations,
            leases: LeaseStore::new(self.pool.clone(), schema, self.config.shared_channel.clone()),
            broadcaster: ChangeBroadcaster::new(
                self.pool.clone(),
                self.config.shared_channel.clone(),
            ),
            proxies: Arc::new(ProxyRegistry::new(broker.clone(), dispatcher.clone())),
            pool: self.pool,
            config: self.config,
            self_id,
            broker,
            dispatcher,
            cache: self.cache,
            auth: self.auth,
        })
    }
}

/// One instance's view of the cluster, not yet running.
pub struct RealtimeBridge {
    pool: PgPool,
    config: BridgeConfig,
    self_id: InstanceId,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    proxies: Arc<ProxyRegistry>,
    registrations: RegistrationStore,
    local: Arc<LocalRegistry>,
    leases: LeaseStore,
    broadcaster: ChangeBroadcaster,
    cache: Arc<dyn CacheReloader>,
    auth: Arc<dyn AuthRecordLoader>,
}

impl RealtimeBridge {
    pub fn builder(pool: PgPool) -> RealtimeBridgeBuilder {
        RealtimeBridgeBuilder::new(pool)
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.self_id
    }

    /// Ensure the schema, then spawn heartbeat, shared router and direct router
    /// under one cancellation scope.
    pub async fn start(self) -> Result<BridgeHandle> {
        SchemaManager::new(self.pool.clone())
            .sync(&SchemaConfig::new(self.config.schema.clone()))
            .await?;

        let cancel = CancellationToken::new();
        let alarm = ProtocolAlarm::new(self.config.protocol_errors, cancel.clone());
        let backoff = self.config.retry_backoff;

        let heartbeat = Heartbeat::new(
            self.leases.clone(),
            self.self_id.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_jitter,
            self.config.lease_ttl,
            backoff,
        );

        let shared = SharedRouter::new(
            self.self_id.clone(),
            self.proxies.clone(),
            Reconciler::new(self.registrations.clone(), self.proxies.clone(), self.auth.clone()),
            self.local.clone(),
            self.cache.clone(),
            alarm.clone(),
        );
        let direct = DirectRouter::new(self.self_id.clone(), self.broker.clone(), alarm.clone());

        let (shared_ready_tx, shared_ready) = watch::channel(false);
        let (direct_ready_tx, direct_ready) = watch::channel(false);

        let tasks = vec![
            tokio::spawn({
                let cancel = cancel.clone();
                async move { heartbeat.run(&cancel).await }
            }),
            spawn_listener(
                NotificationListener::new(
                    self.pool.clone(),
                    self.config.shared_channel.clone(),
                    backoff,
                ),
                Ready::new(shared, shared_ready_tx),
                cancel.clone(),
            ),
            spawn_listener(
                NotificationListener::new(self.pool.clone(), self.self_id.to_string(), backoff),
                Ready::new(direct, direct_ready_tx),
                cancel.clone(),
            ),
        ];

        info!(instance_id = %self.self_id, shared_channel = %self.config.shared_channel, "realtime bridge started");

        Ok(BridgeHandle {
            self_id: self.self_id,
            cancel,
            alarm,
            tasks,
            ready: [shared_ready, direct_ready],
            broker: self.broker,
            dispatcher: self.dispatcher,
            proxies: self.proxies,
            registrations: self.registrations,
            local: self.local,
            leases: self.leases,
            broadcaster: self.broadcaster,
        })
    }
}

fn spawn_listener<H>(
    listener: NotificationListener,
    handler: H,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    H: NotificationHandler + 'static,
{
    tokio::spawn(async move { listener.run(&handler, &cancel).await })
}

/// Flags a listener as ready after its first successful (re)connect.
struct Ready<H> {
    inner: H,
    ready: watch::Sender<bool>,
}

impl<H> Ready<H> {
    fn new(inner: H, ready: watch::Sender<bool>) -> Self {
        Self { inner, ready }
    }
}

#[async_trait]
impl<H> NotificationHandler for Ready<H>
where
    H: NotificationHandler,
{
    async fn on_reconnect(&self) -> Result<()> {
        self.inner.on_reconnect().await?;
        self.ready.send_replace(true);
        Ok(())
    }

    async fn on_message(&self, payload: &str) -> Result<()> {
        self.inner.on_message(payload).await
    }
}

/// A running bridge. Hand clones of [`BridgeHandle::dispatcher`] to whatever
/// needs to reach clients on other instances.
pub struct BridgeHandle {
    self_id: InstanceId,
    cancel: CancellationToken,
    alarm: ProtocolAlarm,
    tasks: Vec<JoinHandle<()>>,
    ready: [watch::Receiver<bool>; 2],
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    proxies: Arc<ProxyRegistry>,
    registrations: RegistrationStore,
    local: Arc<LocalRegistry>,
    leases: LeaseStore,
    broadcaster: ChangeBroadcaster,
}

impl BridgeHandle {
    pub fn instance_id(&self) -> &InstanceId {
        &self.self_id
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    pub fn registrations(&self) -> &RegistrationStore {
        &self.registrations
    }

    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    /// Whether a protocol error was raised since start.
    pub fn is_faulted(&self) -> bool {
        self.alarm.is_faulted()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once both channels have subscribed (and reconciled) at least once.
    pub async fn ready(&self, within: Duration) -> Result<()> {
        let wait = async {
            for ready in &self.ready {
                let mut ready = ready.clone();
                if ready.wait_for(|ok| *ok).await.is_err() {
                    return Err(Error::ConnectionLost("bridge stopped before ready".into()));
                }
            }
            Ok(())
        };
        tokio::time::timeout(within, wait)
            .await
            .map_err(|_| Error::ConnectionLost("bridge not ready in time".into()))?
    }

    /// Register a client connected to this instance and announce it to peers.
    pub async fn connect_local(
        &self,
        client: Arc<dyn Client>,
        registration: ClientRegistration,
        auth_record: &Value,
    ) -> Result<ClientRegistration> {
        let mut registration = registration;
        registration.client_id = client.id().to_string();
        registration.instance_id = self.self_id.to_string();
        self.broker.register(client);
        self.local.upsert(&registration, auth_record).await
    }

    pub async fn disconnect_local(&self, client_id: &str) -> Result<bool> {
        self.broker.unregister(client_id);
        self.local.delete(client_id).await
    }

    /// See [`Dispatcher::deliver`].
    pub async fn deliver(&self, instance_id: &str, client_id: &str, message: Message) -> Result<()> {
        self.dispatcher
            .deliver(self.broker.as_ref(), instance_id, client_id, message)
            .await
    }

    /// Resolves when the bridge loops were asked to stop, by [`Self::shutdown`]
    /// or by the protocol error policy.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Stop the loops, then release the lease so peers drop our clients now.
    pub async fn shutdown(self) -> Result<()> {
        let leases = self.leases.clone();
        let self_id = self.self_id.clone();
        self.abandon().await;
        let dropped = leases.release(&self_id).await?;
        info!(instance_id = %self_id, dropped, "realtime bridge shut down");
        Ok(())
    }

    /// Stop the loops without telling anyone; peers notice once the lease expires.
    pub async fn abandon(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(instance_id = %self.self_id, error = %err, "bridge task ended abnormally");
            }
        }
    }
}
