//! Wire format for the shared and direct channels.
//!
//! Every payload is UTF-8 text with `|`-delimited fields. Decoders only split on
//! the first N-1 delimiters, so the last field may itself contain `|`.

use serde_json::Value;

use crate::{Error, Result, registry::ClientRegistration};

pub const DELIMITER: char = '|';

/// Placeholder body for events that carry no data.
pub const EMPTY_PAYLOAD: &str = "empty-payload";

pub const SUBSCRIPTION_UPSERT: &str = "subscription_upsert";
pub const SUBSCRIPTION_DELETE: &str = "subscription_delete";
pub const SUBSCRIPTION_CHANNEL_OFFLINE: &str = "subscription_channel_offline";
pub const COLLECTION_UPDATED: &str = "collection_updated";
pub const SETTINGS_UPDATED: &str = "settings_updated";

/// Unit exchanged between the bridge and a local client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Lossy view of the body, for logging.
    pub fn data_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Cluster-wide control events broadcast on the shared channel.
#[derive(Clone, Debug, PartialEq)]
pub enum SharedEvent {
    SubscriptionUpsert {
        registration: ClientRegistration,
        auth_record: Value,
    },
    SubscriptionDelete {
        client_id: String,
    },
    ChannelOffline {
        instance_id: String,
    },
    CollectionUpdated,
    SettingsUpdated,
}

impl SharedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SharedEvent::SubscriptionUpsert { .. } => SUBSCRIPTION_UPSERT,
            SharedEvent::SubscriptionDelete { .. } => SUBSCRIPTION_DELETE,
            SharedEvent::ChannelOffline { .. } => SUBSCRIPTION_CHANNEL_OFFLINE,
            SharedEvent::CollectionUpdated => COLLECTION_UPDATED,
            SharedEvent::SettingsUpdated => SETTINGS_UPDATED,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let body = match self {
            SharedEvent::SubscriptionUpsert {
                registration,
                auth_record,
            } => format!(
                "{}{DELIMITER}{}",
                serde_json::to_string(registration)?,
                serde_json::to_string(auth_record)?
            ),
            SharedEvent::SubscriptionDelete { client_id } => client_id.clone(),
            SharedEvent::ChannelOffline { instance_id } => instance_id.clone(),
            SharedEvent::CollectionUpdated | SharedEvent::SettingsUpdated => {
                EMPTY_PAYLOAD.to_string()
            }
        };
        Ok(format!("{}{DELIMITER}{body}", self.kind()))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let (kind, rest) = payload
            .split_once(DELIMITER)
            .ok_or_else(|| Error::malformed("shared", "missing type delimiter"))?;

        match kind {
            SUBSCRIPTION_UPSERT => decode_upsert(rest),
            SUBSCRIPTION_DELETE => Ok(SharedEvent::SubscriptionDelete {
                client_id: non_empty(rest, "client id")?,
            }),
            SUBSCRIPTION_CHANNEL_OFFLINE => Ok(SharedEvent::ChannelOffline {
                instance_id: non_empty(rest, "instance id")?,
            }),
            COLLECTION_UPDATED => Ok(SharedEvent::CollectionUpdated),
            SETTINGS_UPDATED => Ok(SharedEvent::SettingsUpdated),
            other => Err(Error::UnknownMessageType(other.to_string())),
        }
    }
}

/// `<registrationJSON>|<authRecordJSON>`. The registration is read as exactly one
/// JSON value so a `|` inside one of its strings cannot shift the split.
fn decode_upsert(rest: &str) -> Result<SharedEvent> {
    let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<ClientRegistration>();
    let registration = match stream.next() {
        Some(Ok(registration)) => registration,
        Some(Err(err)) => {
            return Err(Error::malformed("shared", format!("registration json: {err}")));
        }
        None => return Err(Error::malformed("shared", "missing registration json")),
    };
    let offset = stream.byte_offset();
    let auth = rest[offset..]
        .strip_prefix(DELIMITER)
        .ok_or_else(|| Error::malformed("shared", "missing auth record delimiter"))?;
    let auth_record = if auth.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(auth)
            .map_err(|err| Error::malformed("shared", format!("auth record json: {err}")))?
    };
    if registration.client_id.is_empty() || registration.instance_id.is_empty() {
        return Err(Error::malformed(
            "shared",
            "registration without client or instance id",
        ));
    }
    Ok(SharedEvent::SubscriptionUpsert {
        registration,
        auth_record,
    })
}

fn non_empty(field: &str, what: &str) -> Result<String> {
    if field.is_empty() {
        return Err(Error::malformed("shared", format!("empty {what}")));
    }
    Ok(field.to_string())
}

/// Point-to-point message on an instance's direct channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectEnvelope {
    pub client_id: String,
    pub message: Message,
}

impl DirectEnvelope {
    pub fn new(client_id: impl Into<String>, message: Message) -> Self {
        Self {
            client_id: client_id.into(),
            message,
        }
    }

    /// `<clientId>|<messageName>|<messageData>`.
    pub fn encode(&self) -> Result<String> {
        if self.client_id.is_empty() || self.client_id.contains(DELIMITER) {
            return Err(Error::malformed(
                "direct",
                format!("client id `{}` is empty or contains `|`", self.client_id),
            ));
        }
        if self.message.name.contains(DELIMITER) {
            return Err(Error::malformed(
                "direct",
                format!("message name `{}` contains `|`", self.message.name),
            ));
        }
        let data = std::str::from_utf8(&self.message.data)
            .map_err(|_| Error::malformed("direct", "message data is not valid UTF-8"))?;
        Ok(format!(
            "{}{DELIMITER}{}{DELIMITER}{data}",
            self.client_id, self.message.name
        ))
    }

    pub fn decode(channel: &str, payload: &str) -> Result<Self> {
        let mut parts = payload.splitn(3, DELIMITER);
        let (Some(client_id), Some(name), Some(data)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::malformed(channel, "expected clientId|name|data"));
        };
        if client_id.is_empty() {
            return Err(Error::malformed(channel, "empty client id"));
        }
        Ok(Self {
            client_id: client_id.to_string(),
            message: Message::new(name, data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration() -> ClientRegistration {
        ClientRegistration::new("c1", "rc_node_a")
            .with_subscriptions(["records/demo", "weird|topic"])
            .with_auth("users", "u1")
    }

    #[test]
    fn direct_payload_keeps_delimiters_in_data() {
        let envelope = DirectEnvelope::new("c1", Message::new("m", "a|b"));
        let wire = envelope.encode().unwrap();
        assert_eq!(wire, "c1|m|a|b");
        let decoded = DirectEnvelope::decode("rc_node_a", &wire).unwrap();
        assert_eq!(decoded.client_id, "c1");
        assert_eq!(decoded.message.name, "m");
        assert_eq!(decoded.message.data, b"a|b");
    }

    #[test]
    fn direct_payload_allows_empty_data() {
        let decoded = DirectEnvelope::decode("rc_node_a", "c1|PB_CONNECT|").unwrap();
        assert!(decoded.message.data.is_empty());
    }

    #[test]
    fn direct_encode_rejects_ambiguous_fields() {
        assert!(DirectEnvelope::new("c|1", Message::new("m", "x")).encode().is_err());
        assert!(DirectEnvelope::new("c1", Message::new("m|n", "x")).encode().is_err());
        assert!(
            DirectEnvelope::new("c1", Message::new("m", vec![0xff, 0xfe]))
                .encode()
                .is_err()
        );
    }

    #[test]
    fn direct_decode_rejects_short_payloads() {
        let err = DirectEnvelope::decode("rc_node_a", "c1|only-two").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn upsert_survives_pipes_inside_json() {
        let event = SharedEvent::SubscriptionUpsert {
            registration: registration(),
            auth_record: json!({"id": "u1", "note": "x|y"}),
        };
        let wire = event.encode().unwrap();
        assert!(wire.starts_with("subscription_upsert|{"));
        assert_eq!(SharedEvent::decode(&wire).unwrap(), event);
    }

    #[test]
    fn upsert_with_empty_auth_record_is_null() {
        let json = serde_json::to_string(&registration()).unwrap();
        let decoded = SharedEvent::decode(&format!("subscription_upsert|{json}|")).unwrap();
        match decoded {
            SharedEvent::SubscriptionUpsert { auth_record, .. } => assert!(auth_record.is_null()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn upsert_with_broken_json_is_protocol_error() {
        let err = SharedEvent::decode("subscription_upsert|{not json|null").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn simple_events_decode() {
        assert_eq!(
            SharedEvent::decode("subscription_delete|c9").unwrap(),
            SharedEvent::SubscriptionDelete {
                client_id: "c9".into()
            }
        );
        assert_eq!(
            SharedEvent::decode("subscription_channel_offline|rc_dead_1").unwrap(),
            SharedEvent::ChannelOffline {
                instance_id: "rc_dead_1".into()
            }
        );
        assert_eq!(
            SharedEvent::decode("collection_updated|empty-payload").unwrap(),
            SharedEvent::CollectionUpdated
        );
        assert_eq!(
            SharedEvent::SettingsUpdated.encode().unwrap(),
            "settings_updated|empty-payload"
        );
    }

    #[test]
    fn unknown_type_is_surfaced() {
        let err = SharedEvent::decode("record_created|abc").unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(ref t) if t == "record_created"));
        assert!(SharedEvent::decode("no-delimiter").unwrap_err().is_protocol());
    }
}
