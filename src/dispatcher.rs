use std::sync::atomic::Ordering;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error};

use crate::{
    Error, Result,
    broker::Broker,
    instance::InstanceId,
    metrics::metrics,
    protocol::{DirectEnvelope, Message},
    pubsub,
};

/// The narrow slice of the bridge that proxies and other components need.
#[async_trait]
pub trait BridgeSender: Send + Sync {
    fn self_instance_id(&self) -> &InstanceId;

    /// Publish `message` for `client_id` on `instance_id`'s direct channel.
    async fn send_via_bridge(
        &self,
        instance_id: &str,
        client_id: &str,
        message: &Message,
    ) -> Result<()>;
}

/// Outbound side of the bridge. At-most-once: no acknowledgement, no retry, no
/// ordering guarantee between two dispatches to the same client.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    pool: PgPool,
    self_id: InstanceId,
}

impl Dispatcher {
    pub fn new(pool: PgPool, self_id: InstanceId) -> Self {
        Self { pool, self_id }
    }

    /// Deliver to `client_id` wherever it lives: straight into the local broker
    /// when `instance_id` is us, over the bridge otherwise.
    pub async fn deliver(
        &self,
        broker: &dyn Broker,
        instance_id: &str,
        client_id: &str,
        message: Message,
    ) -> Result<()> {
        if self.self_id != instance_id {
            return self.send_via_bridge(instance_id, client_id, &message).await;
        }
        let client = broker.client_by_id(client_id)?;
        if let Some(remote) = client.as_remote() {
            let owner = remote.owning_instance_id();
            error!(target: "rillcast::routing", client_id, owner = %owner, "local delivery resolved to a bridged client");
            return Err(Error::MisroutedDelivery {
                client_id: client_id.to_string(),
                owner,
            });
        }
        client.send(message).await
    }
}

#[async_trait]
impl BridgeSender for Dispatcher {
    fn self_instance_id(&self) -> &InstanceId {
        &self.self_id
    }

    async fn send_via_bridge(
        &self,
        instance_id: &str,
        client_id: &str,
        message: &Message,
    ) -> Result<()> {
        if self.self_id == instance_id {
            error!(
                target: "rillcast::routing",
                instance_id,
                client_id,
                name = %message.name,
                "bridge dispatch targeted this instance"
            );
            return Err(Error::SelfDispatch {
                instance_id: instance_id.to_string(),
                client_id: client_id.to_string(),
            });
        }

        let payload = DirectEnvelope::new(client_id, message.clone()).encode()?;
        pubsub::publish(&self.pool, instance_id, &payload).await?;
        metrics()
            .bridge_dispatch_total
            .fetch_add(1, Ordering::Relaxed);
        debug!(instance_id, client_id, name = %message.name, "dispatched over bridge");
        Ok(())
    }
}
