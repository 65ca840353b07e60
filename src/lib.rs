//! Rillcast: multi-instance realtime bridge over Postgres LISTEN/NOTIFY.

pub mod alarm;
pub mod bridge;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod direct;
pub mod dispatcher;
mod error;
pub mod heartbeat;
pub mod instance;
pub mod lease;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod pubsub;
pub mod reconcile;
pub mod registry;
pub mod schema;
pub mod shared;
pub mod testing;

pub use bridge::{BridgeHandle, RealtimeBridge};
pub use broker::{Broker, Client, MemoryBroker, RemoteClient};
pub use config::{BridgeConfig, ProtocolErrorPolicy};
pub use dispatcher::{BridgeSender, Dispatcher};
pub use error::{Error, Result, WithContext};
pub use instance::InstanceId;
pub use protocol::Message;
pub use registry::ClientRegistration;
pub use schema::{SchemaConfig, SchemaManager, SchemaPlan};

pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeHandle, BridgeSender, Client, ClientRegistration, InstanceId, Message,
        RealtimeBridge, Result,
    };
}
