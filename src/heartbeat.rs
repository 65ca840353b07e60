use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, instance::InstanceId, lease::LeaseStore, metrics::metrics};

/// Keeps this instance's lease alive and reaps peers whose lease ran out.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    leases: LeaseStore,
    self_id: InstanceId,
    interval: Duration,
    jitter: Duration,
    lease_ttl: Duration,
    retry_backoff: Duration,
}

impl Heartbeat {
    pub fn new(
        leases: LeaseStore,
        self_id: InstanceId,
        interval: Duration,
        jitter: Duration,
        lease_ttl: Duration,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            leases,
            self_id,
            interval,
            jitter,
            lease_ttl,
            retry_backoff,
        }
    }

    /// One tick: renew, reap, announce. Returns the reaped instance ids.
    pub async fn beat(&self) -> Result<Vec<String>> {
        let reaped = self.leases.heartbeat(&self.self_id, self.lease_ttl).await?;
        if !reaped.is_empty() {
            metrics()
                .instances_reaped_total
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            info!(instance_id = %self.self_id, reaped = ?reaped, "reaped expired instance leases");
        }
        Ok(reaped)
    }

    /// Interval minus a random jitter so peers started together drift apart.
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval
            .saturating_sub(Duration::from_millis(jitter_ms))
    }

    /// Beats until `cancel` fires. A failed tick is retried after the backoff
    /// rather than skipped.
    pub async fn run(&self, cancel: &CancellationToken) {
        loop {
            let delay = match self.beat().await {
                Ok(_) => self.next_delay(),
                Err(err) => {
                    metrics()
                        .heartbeat_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(instance_id = %self.self_id, error = %err, "heartbeat failed; retrying");
                    self.retry_backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!(instance_id = %self.self_id, "heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::lazy_pool;

    fn heartbeat(interval: u64, jitter: u64) -> Heartbeat {
        Heartbeat::new(
            LeaseStore::new(lazy_pool(), "public", "rillcast_shared"),
            InstanceId::parse("rc_a"),
            Duration::from_secs(interval),
            Duration::from_secs(jitter),
            Duration::from_secs(40),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn delay_stays_within_jitter_window() {
        let hb = heartbeat(30, 5);
        for _ in 0..200 {
            let delay = hb.next_delay();
            assert!(delay <= Duration::from_secs(30));
            assert!(delay >= Duration::from_secs(25));
        }
    }

    #[tokio::test]
    async fn zero_jitter_is_exact() {
        assert_eq!(heartbeat(30, 0).next_delay(), Duration::from_secs(30));
    }
}
