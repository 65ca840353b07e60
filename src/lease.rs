use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    Result,
    instance::InstanceId,
    protocol::{DELIMITER, SUBSCRIPTION_CHANNEL_OFFLINE},
    pubsub,
    schema::{CLIENT_REGISTRATIONS, INSTANCE_LEASES, qualified_name},
};

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct InstanceLease {
    pub instance_id: String,
    pub valid_until: DateTime<Utc>,
}

impl InstanceLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}

/// Data access for `instance_leases`.
#[derive(Clone, Debug)]
pub struct LeaseStore {
    pool: PgPool,
    leases: String,
    registrations: String,
    shared_channel: String,
}

impl LeaseStore {
    pub fn new(pool: PgPool, schema: &str, shared_channel: impl Into<String>) -> Self {
        Self {
            pool,
            leases: qualified_name(schema, INSTANCE_LEASES),
            registrations: qualified_name(schema, CLIENT_REGISTRATIONS),
            shared_channel: shared_channel.into(),
        }
    }

    /// Renew our lease, reap every expired peer lease, drop the reaped peers'
    /// client registrations and announce each reaped peer as offline.
    ///
    /// One statement, so a renewal can never interleave with a peer concluding
    /// that we are dead. Our own row is excluded from reaping because a single
    /// statement may not both update and delete it.
    pub async fn heartbeat(&self, self_id: &InstanceId, ttl: Duration) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            with renewed as (
                insert into {leases} (instance_id, valid_until)
                values ($1, now() + make_interval(secs => $2))
                on conflict (instance_id) do update set valid_until = excluded.valid_until
                returning instance_id
            ), expired as (
                delete from {leases}
                 where valid_until < now()
                   and instance_id <> $1
                returning instance_id
            ), orphaned as (
                delete from {registrations} r
                 using expired e
                 where r.instance_id = e.instance_id
                returning r.client_id
            )
            select e.instance_id
              from expired e
             cross join lateral (
                select pg_notify($3, $4 || e.instance_id)
             ) announced
             order by e.instance_id
            "#,
            leases = self.leases,
            registrations = self.registrations,
        );
        let reaped: Vec<String> = sqlx::query_scalar(&sql)
            .bind(self_id.as_str())
            .bind(ttl.as_secs_f64())
            .bind(&self.shared_channel)
            .bind(offline_prefix())
            .fetch_all(&self.pool)
            .await?;
        Ok(reaped)
    }

    /// Clean shutdown: drop our lease and our registrations and tell peers right away
    /// instead of letting them wait for the lease to expire.
    pub async fn release(&self, self_id: &InstanceId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "delete from {leases} where instance_id = $1",
            leases = self.leases
        ))
        .bind(self_id.as_str())
        .execute(&mut *tx)
        .await?;
        let dropped = sqlx::query(&format!(
            "delete from {registrations} where instance_id = $1",
            registrations = self.registrations
        ))
        .bind(self_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let payload = format!("{}{}", offline_prefix(), self_id);
        pubsub::publish(&mut *tx, &self.shared_channel, &payload).await?;
        tx.commit().await?;
        Ok(dropped)
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<InstanceLease>> {
        let lease = sqlx::query_as::<_, InstanceLease>(&format!(
            "select instance_id, valid_until from {leases} where instance_id = $1",
            leases = self.leases
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lease)
    }

    pub async fn list(&self) -> Result<Vec<InstanceLease>> {
        let leases = sqlx::query_as::<_, InstanceLease>(&format!(
            "select instance_id, valid_until from {leases} order by instance_id",
            leases = self.leases
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(leases)
    }
}

fn offline_prefix() -> String {
    format!("{SUBSCRIPTION_CHANNEL_OFFLINE}{DELIMITER}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SharedEvent;

    #[test]
    fn offline_prefix_builds_decodable_event() {
        let payload = format!("{}{}", offline_prefix(), "rc_dead_1");
        assert_eq!(
            SharedEvent::decode(&payload).unwrap(),
            SharedEvent::ChannelOffline {
                instance_id: "rc_dead_1".into()
            }
        );
    }

    #[test]
    fn expiry_is_strict() {
        let now = Utc::now();
        let lease = InstanceLease {
            instance_id: "rc_a".into(),
            valid_until: now,
        };
        assert!(!lease.is_expired_at(now));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(1)));
    }
}
