use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{
    Error, Result,
    alarm::ProtocolAlarm,
    broker::Broker,
    instance::InstanceId,
    metrics::metrics,
    protocol::DirectEnvelope,
    pubsub::NotificationHandler,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The client disconnected between publish and delivery.
    ClientGone,
    /// The addressed client is itself a proxy here, so this instance is not its owner.
    Misrouted { owner: String },
}

/// Delivers point-to-point messages arriving on this instance's own channel.
pub struct DirectRouter {
    self_id: InstanceId,
    broker: Arc<dyn Broker>,
    alarm: ProtocolAlarm,
}

impl DirectRouter {
    pub fn new(self_id: InstanceId, broker: Arc<dyn Broker>, alarm: ProtocolAlarm) -> Self {
        Self {
            self_id,
            broker,
            alarm,
        }
    }

    pub async fn route(&self, envelope: DirectEnvelope) -> Result<Delivery> {
        let DirectEnvelope { client_id, message } = envelope;
        let client = match self.broker.client_by_id(&client_id) {
            Ok(client) => client,
            Err(Error::ClientNotFound(_)) => {
                metrics()
                    .direct_dropped_total
                    .fetch_add(1, Ordering::Relaxed);
                debug!(client_id = %client_id, name = %message.name, "direct message for disconnected client dropped");
                return Ok(Delivery::ClientGone);
            }
            Err(err) => return Err(err),
        };

        if let Some(remote) = client.as_remote() {
            let owner = remote.owning_instance_id();
            metrics()
                .direct_misrouted_total
                .fetch_add(1, Ordering::Relaxed);
            error!(
                target: "rillcast::routing",
                instance_id = %self.self_id,
                client_id = %client_id,
                owner = %owner,
                name = %message.name,
                data = %message.data_lossy(),
                "direct message addressed to a bridged client; dropping"
            );
            return Ok(Delivery::Misrouted { owner });
        }

        client.send(message).await?;
        metrics()
            .direct_delivered_total
            .fetch_add(1, Ordering::Relaxed);
        Ok(Delivery::Delivered)
    }
}

#[async_trait]
impl NotificationHandler for DirectRouter {
    async fn on_message(&self, payload: &str) -> Result<()> {
        match DirectEnvelope::decode(self.self_id.as_str(), payload) {
            Ok(envelope) => self.route(envelope).await.map(|_| ()),
            Err(err) => {
                self.alarm.raise(self.self_id.as_str(), payload, &err);
                Ok(())
            }
        }
    }
}
