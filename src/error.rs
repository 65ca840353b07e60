use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown message type `{0}` (peer running an incompatible version?)")]
    UnknownMessageType(String),
    #[error("malformed payload on `{channel}`: {reason}")]
    MalformedPayload { channel: String, reason: String },
    #[error("refusing to dispatch client {client_id} to own instance {instance_id} over the bridge")]
    SelfDispatch {
        instance_id: String,
        client_id: String,
    },
    #[error("client {client_id} is a bridged proxy owned by {owner}, not a local client")]
    MisroutedDelivery { client_id: String, owner: String },
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("notification connection lost on `{0}`")]
    ConnectionLost(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn malformed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedPayload {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Errors that mean a peer speaks a different wire protocol.
    pub fn is_protocol(&self) -> bool {
        match self {
            Error::UnknownMessageType(_) | Error::MalformedPayload { .. } => true,
            Error::Context { source, .. } => source.is_protocol(),
            _ => false,
        }
    }

    /// Errors that mean a message was routed to the wrong place by our own code.
    pub fn is_routing_violation(&self) -> bool {
        match self {
            Error::SelfDispatch { .. } | Error::MisroutedDelivery { .. } => true,
            Error::Context { source, .. } => source.is_routing_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
