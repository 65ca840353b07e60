use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Postgres truncates identifiers (and therefore channel names) past this length.
const MAX_IDENT_LEN: usize = 63;
const PREFIX: &str = "rc_";
const SUFFIX_LEN: usize = 8;

/// Identity of one running server process. Doubles as the name of its direct channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Hostname plus a short random suffix.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::from_parts(&local_hostname(), &suffix[..SUFFIX_LEN])
    }

    pub fn from_parts(host: &str, suffix: &str) -> Self {
        let suffix = normalize(suffix);
        let budget = MAX_IDENT_LEN.saturating_sub(PREFIX.len() + suffix.len() + 1);
        let mut host = normalize(host);
        if host.is_empty() {
            host.push_str("instance");
        }
        host.truncate(budget);
        Self(format!("{PREFIX}{host}_{suffix}"))
    }

    /// Accept an externally configured id, normalizing it into a valid channel name.
    pub fn parse(raw: &str) -> Self {
        let mut id = normalize(raw);
        if !id.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
            id.insert_str(0, PREFIX);
        }
        id.truncate(MAX_IDENT_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for InstanceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for InstanceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl PartialEq<String> for InstanceId {
    fn eq(&self, other: &String) -> bool {
        &self.0 == other
    }
}

/// Lowercase `[a-z0-9_]`, everything else folded to `_`.
fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn local_hostname() -> String {
    if let Ok(host) = std::env::var("HOSTNAME")
        && !host.trim().is_empty()
    {
        return host;
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Channel names are unquoted identifiers: a leading letter or underscore, then `[a-z0-9_]`.
pub fn is_valid_channel(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENT_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
