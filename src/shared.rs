use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    Result,
    alarm::ProtocolAlarm,
    broker::CacheReloader,
    instance::InstanceId,
    protocol::SharedEvent,
    proxy::ProxyRegistry,
    pubsub::NotificationHandler,
    reconcile::{ReconcileReport, Reconciler},
    registry::LocalRegistry,
};

/// Handles cluster-wide events on the shared channel.
pub struct SharedRouter {
    self_id: InstanceId,
    proxies: Arc<ProxyRegistry>,
    reconciler: Reconciler,
    local: Arc<LocalRegistry>,
    cache: Arc<dyn CacheReloader>,
    alarm: ProtocolAlarm,
}

impl SharedRouter {
    pub fn new(
        self_id: InstanceId,
        proxies: Arc<ProxyRegistry>,
        reconciler: Reconciler,
        local: Arc<LocalRegistry>,
        cache: Arc<dyn CacheReloader>,
        alarm: ProtocolAlarm,
    ) -> Self {
        Self {
            self_id,
            proxies,
            reconciler,
            local,
            cache,
            alarm,
        }
    }

    /// Reconcile proxies, then reload caches in case invalidations were missed
    /// while disconnected. Cache reload failures are logged, not fatal.
    pub async fn resync(&self) -> Result<ReconcileReport> {
        let report = self.reconciler.full_refresh().await?;
        if let Err(err) = self.cache.reload_collections().await {
            warn!(error = %err, "reloading cached collections after reconnect failed");
        }
        if let Err(err) = self.cache.reload_settings().await {
            warn!(error = %err, "reloading settings after reconnect failed");
        }
        Ok(report)
    }

    pub async fn apply(&self, event: SharedEvent) -> Result<()> {
        match event {
            SharedEvent::SubscriptionUpsert {
                registration,
                auth_record,
            } => {
                if self.self_id == registration.writer_instance_id {
                    debug!(client_id = %registration.client_id, "ignoring echo of own registration write");
                    return Ok(());
                }
                self.proxies.mirror(registration, auth_record);
            }
            SharedEvent::SubscriptionDelete { client_id } => {
                self.proxies.remove(&client_id);
            }
            SharedEvent::ChannelOffline { instance_id } if self.self_id == instance_id => {
                // A peer reaped our lease (we stalled past the ttl) and dropped our rows.
                warn!(instance_id = %instance_id, "peers declared this instance offline; announcing local clients again");
                self.local.republish().await?;
            }
            SharedEvent::ChannelOffline { instance_id } => {
                let removed = self.proxies.remove_instance(&instance_id);
                info!(offline = %instance_id, removed, "peer instance went offline");
            }
            SharedEvent::CollectionUpdated => self.cache.reload_collections().await?,
            SharedEvent::SettingsUpdated => self.cache.reload_settings().await?,
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationHandler for SharedRouter {
    async fn on_reconnect(&self) -> Result<()> {
        self.resync().await.map(|_| ())
    }

    async fn on_message(&self, payload: &str) -> Result<()> {
        match SharedEvent::decode(payload) {
            Ok(event) => self.apply(event).await,
            Err(err) => {
                self.alarm.raise("shared", payload, &err);
                Ok(())
            }
        }
    }
}
