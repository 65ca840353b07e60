use std::time::Duration;

use crate::{Error, Result, instance::InstanceId, instance::is_valid_channel};

pub const DEFAULT_SHARED_CHANNEL: &str = "rillcast_shared";

/// What to do when a peer sends something this build cannot decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolErrorPolicy {
    /// Log at error level on `rillcast::protocol`, count it, keep bridging.
    #[default]
    Alert,
    /// Alert, then stop the bridge loops. The local broker keeps serving.
    Shutdown,
}

impl std::str::FromStr for ProtocolErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Ok(Self::Alert),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(Error::Config(format!(
                "unknown protocol error policy `{other}` (expected alert|shutdown)"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub schema: String,
    pub shared_channel: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_jitter: Duration,
    pub lease_ttl: Duration,
    pub retry_backoff: Duration,
    pub protocol_errors: ProtocolErrorPolicy,
    pub instance_id: Option<InstanceId>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            shared_channel: DEFAULT_SHARED_CHANNEL.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_jitter: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(40),
            retry_backoff: Duration::from_secs(1),
            protocol_errors: ProtocolErrorPolicy::Alert,
            instance_id: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `RILLCAST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(schema) = lookup("RILLCAST_SCHEMA") {
            config.schema = schema;
        }
        if let Some(channel) = lookup("RILLCAST_SHARED_CHANNEL") {
            config.shared_channel = channel;
        }
        if let Some(secs) = lookup("RILLCAST_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse_u64("RILLCAST_HEARTBEAT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("RILLCAST_JITTER_SECS") {
            config.heartbeat_jitter = Duration::from_secs(parse_u64("RILLCAST_JITTER_SECS", &secs)?);
        }
        if let Some(secs) = lookup("RILLCAST_LEASE_TTL_SECS") {
            config.lease_ttl = Duration::from_secs(parse_u64("RILLCAST_LEASE_TTL_SECS", &secs)?);
        }
        if let Some(ms) = lookup("RILLCAST_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(parse_u64("RILLCAST_RETRY_BACKOFF_MS", &ms)?);
        }
        if let Some(policy) = lookup("RILLCAST_PROTOCOL_ERRORS") {
            config.protocol_errors = policy.parse()?;
        }
        if let Some(id) = lookup("RILLCAST_INSTANCE_ID")
            && !id.trim().is_empty()
        {
            config.instance_id = Some(InstanceId::parse(&id));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_shared_channel(mut self, channel: impl Into<String>) -> Self {
        self.shared_channel = channel.into();
        self
    }

    /// Sets interval, jitter and lease ttl together; they are only meaningful relative to each other.
    pub fn with_heartbeat(mut self, interval: Duration, jitter: Duration, lease_ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_jitter = jitter;
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_protocol_errors(mut self, policy: ProtocolErrorPolicy) -> Self {
        self.protocol_errors = policy;
        self
    }

    pub fn with_instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.trim().is_empty() {
            return Err(Error::Config("schema must not be empty".into()));
        }
        if !is_valid_channel(&self.shared_channel) {
            return Err(Error::Config(format!(
                "shared channel `{}` is not a valid lowercase identifier",
                self.shared_channel
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".into()));
        }
        if self.heartbeat_jitter >= self.heartbeat_interval {
            return Err(Error::Config(
                "heartbeat jitter must be smaller than the heartbeat interval".into(),
            ));
        }
        if self.lease_ttl <= self.heartbeat_interval {
            return Err(Error::Config(
                "lease ttl must exceed the heartbeat interval".into(),
            ));
        }
        if let Some(id) = &self.instance_id
            && id.as_str() == self.shared_channel
        {
            return Err(Error::Config(
                "instance id must differ from the shared channel name".into(),
            ));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected an unsigned integer, got `{raw}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.lease_ttl, Duration::from_secs(40));
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_apply() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("RILLCAST_SCHEMA", "realtime"),
            ("RILLCAST_HEARTBEAT_SECS", "10"),
            ("RILLCAST_JITTER_SECS", "2"),
            ("RILLCAST_LEASE_TTL_SECS", "15"),
            ("RILLCAST_PROTOCOL_ERRORS", "Shutdown"),
            ("RILLCAST_INSTANCE_ID", "Node-7"),
        ]))
        .unwrap();
        assert_eq!(config.schema, "realtime");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.protocol_errors, ProtocolErrorPolicy::Shutdown);
        assert_eq!(config.instance_id.unwrap().as_str(), "node_7");
    }

    #[test]
    fn rejects_lease_shorter_than_interval() {
        let err = BridgeConfig::from_lookup(lookup(&[("RILLCAST_LEASE_TTL_SECS", "20")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_bad_numbers_and_channels() {
        assert!(BridgeConfig::from_lookup(lookup(&[("RILLCAST_HEARTBEAT_SECS", "soon")])).is_err());
        assert!(
            BridgeConfig::from_lookup(lookup(&[("RILLCAST_SHARED_CHANNEL", "Bad-Name")])).is_err()
        );
        assert!("panic".parse::<ProtocolErrorPolicy>().is_err());
    }
}
