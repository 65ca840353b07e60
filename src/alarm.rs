use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{Error, config::ProtocolErrorPolicy, metrics::metrics};

/// Where undecodable peer traffic is reported. Protocol errors mean the
/// instances disagree on the wire format, so they are never silently dropped.
#[derive(Clone, Debug)]
pub struct ProtocolAlarm {
    policy: ProtocolErrorPolicy,
    cancel: CancellationToken,
    faulted: Arc<AtomicBool>,
}

impl ProtocolAlarm {
    pub fn new(policy: ProtocolErrorPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            faulted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn raise(&self, channel: &str, payload: &str, err: &Error) {
        metrics()
            .protocol_errors_total
            .fetch_add(1, Ordering::Relaxed);
        self.faulted.store(true, Ordering::Release);
        error!(
            target: "rillcast::protocol",
            channel,
            payload,
            error = %err,
            policy = ?self.policy,
            "undecodable bridge message; peers may be running an incompatible version"
        );
        if self.policy == ProtocolErrorPolicy::Shutdown {
            self.cancel.cancel();
        }
    }

    /// Whether any protocol error was raised since start.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_policy_keeps_running() {
        let cancel = CancellationToken::new();
        let alarm = ProtocolAlarm::new(ProtocolErrorPolicy::Alert, cancel.clone());
        alarm.raise("shared", "bogus|x", &Error::UnknownMessageType("bogus".into()));
        assert!(alarm.is_faulted());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn shutdown_policy_cancels_scope() {
        let cancel = CancellationToken::new();
        let alarm = ProtocolAlarm::new(ProtocolErrorPolicy::Shutdown, cancel.clone());
        alarm.raise("shared", "bogus|x", &Error::UnknownMessageType("bogus".into()));
        assert!(cancel.is_cancelled());
    }
}
