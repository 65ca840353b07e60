use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::{
    Result,
    instance::InstanceId,
    protocol::SharedEvent,
    pubsub,
    schema::{CLIENT_REGISTRATIONS, qualified_name},
};

/// Persisted record of which instance owns a realtime client and what it listens to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub instance_id: String,
    #[serde(default, deserialize_with = "nullable_set")]
    pub subscriptions: BTreeSet<String>,
    #[serde(default)]
    pub auth_collection_ref: String,
    #[serde(default)]
    pub auth_record_ref: String,
    /// Who wrote this row; only used to drop echoes of our own writes.
    #[serde(default)]
    pub writer_instance_id: String,
}

impl ClientRegistration {
    pub fn new(client_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn with_subscriptions<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auth(mut self, collection_ref: impl Into<String>, record_ref: impl Into<String>) -> Self {
        self.auth_collection_ref = collection_ref.into();
        self.auth_record_ref = record_ref.into();
        self
    }

    pub fn has_subscription(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn same_auth(&self, other: &ClientRegistration) -> bool {
        self.auth_collection_ref == other.auth_collection_ref
            && self.auth_record_ref == other.auth_record_ref
    }

    pub fn is_authenticated(&self) -> bool {
        !self.auth_record_ref.is_empty()
    }
}

fn nullable_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeSet<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(sqlx::FromRow)]
struct RegistrationRow {
    client_id: String,
    instance_id: String,
    subscriptions: Vec<String>,
    auth_collection_ref: String,
    auth_record_ref: String,
    writer_instance_id: String,
}

impl From<RegistrationRow> for ClientRegistration {
    fn from(row: RegistrationRow) -> Self {
        Self {
            client_id: row.client_id,
            instance_id: row.instance_id,
            subscriptions: row.subscriptions.into_iter().collect(),
            auth_collection_ref: row.auth_collection_ref,
            auth_record_ref: row.auth_record_ref,
            writer_instance_id: row.writer_instance_id,
        }
    }
}

const COLUMNS: &str = "client_id, instance_id, subscriptions, auth_collection_ref, auth_record_ref, writer_instance_id";

/// Data access for `client_registrations`, bound to the writing instance.
#[derive(Clone, Debug)]
pub struct RegistrationStore {
    pool: PgPool,
    table: String,
    shared_channel: String,
    self_id: InstanceId,
}

impl RegistrationStore {
    pub fn new(
        pool: PgPool,
        schema: &str,
        shared_channel: impl Into<String>,
        self_id: InstanceId,
    ) -> Self {
        Self {
            pool,
            table: qualified_name(schema, CLIENT_REGISTRATIONS),
            shared_channel: shared_channel.into(),
            self_id,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.self_id
    }

    /// Upsert a registration stamped with our own writer id and announce it on the
    /// shared channel. Both happen in one transaction; peers see the notification
    /// only once the row is committed.
    pub async fn upsert(
        &self,
        registration: &ClientRegistration,
        auth_record: &Value,
    ) -> Result<ClientRegistration> {
        let mut stamped = registration.clone();
        stamped.writer_instance_id = self.self_id.to_string();

        let payload = SharedEvent::SubscriptionUpsert {
            registration: stamped.clone(),
            auth_record: auth_record.clone(),
        }
        .encode()?;

        let subscriptions: Vec<String> = stamped.subscriptions.iter().cloned().collect();
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"insert into {table} ({COLUMNS})
               values ($1, $2, $3, $4, $5, $6)
               on conflict (client_id) do update
                 set instance_id = excluded.instance_id,
                     subscriptions = excluded.subscriptions,
                     auth_collection_ref = excluded.auth_collection_ref,
                     auth_record_ref = excluded.auth_record_ref,
                     writer_instance_id = excluded.writer_instance_id"#,
            table = self.table,
        ))
        .bind(&stamped.client_id)
        .bind(&stamped.instance_id)
        .bind(&subscriptions)
        .bind(&stamped.auth_collection_ref)
        .bind(&stamped.auth_record_ref)
        .bind(&stamped.writer_instance_id)
        .execute(&mut *tx)
        .await?;
        pubsub::publish(&mut *tx, &self.shared_channel, &payload).await?;
        tx.commit().await?;

        debug!(client_id = %stamped.client_id, instance_id = %stamped.instance_id, "client registration upserted");
        Ok(stamped)
    }

    /// Delete a registration, announcing it only if a row actually existed.
    pub async fn delete(&self, client_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&format!(
            "delete from {table} where client_id = $1",
            table = self.table
        ))
        .bind(client_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted > 0 {
            let payload = SharedEvent::SubscriptionDelete {
                client_id: client_id.to_string(),
            }
            .encode()?;
            pubsub::publish(&mut *tx, &self.shared_channel, &payload).await?;
        }
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>> {
        let row: Option<RegistrationRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from {table} where client_id = $1",
            table = self.table
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Every row this instance did not author itself.
    pub async fn list_foreign(&self) -> Result<Vec<ClientRegistration>> {
        let rows: Vec<RegistrationRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from {table} where writer_instance_id <> $1 order by client_id",
            table = self.table
        ))
        .bind(self.self_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<ClientRegistration>> {
        let rows: Vec<RegistrationRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from {table} where instance_id = $1 order by client_id",
            table = self.table
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<ClientRegistration>> {
        let rows: Vec<RegistrationRow> = sqlx::query_as(&format!(
            "select {COLUMNS} from {table} order by instance_id, client_id",
            table = self.table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Registrations of clients connected to this instance, remembered so they can
/// be written again after peers reaped this instance's lease.
#[derive(Debug)]
pub struct LocalRegistry {
    store: RegistrationStore,
    entries: Mutex<BTreeMap<String, (ClientRegistration, Value)>>,
}

impl LocalRegistry {
    pub fn new(store: RegistrationStore) -> Self {
        Self {
            store,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &RegistrationStore {
        &self.store
    }

    pub async fn upsert(
        &self,
        registration: &ClientRegistration,
        auth_record: &Value,
    ) -> Result<ClientRegistration> {
        let stamped = self.store.upsert(registration, auth_record).await?;
        self.entries
            .lock()
            .expect("local registry poisoned")
            .insert(stamped.client_id.clone(), (stamped.clone(), auth_record.clone()));
        Ok(stamped)
    }

    pub async fn delete(&self, client_id: &str) -> Result<bool> {
        self.entries
            .lock()
            .expect("local registry poisoned")
            .remove(client_id);
        self.store.delete(client_id).await
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("local registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Upsert every remembered registration again. Clients deleted meanwhile are skipped.
    pub async fn republish(&self) -> Result<usize> {
        let mut republished = 0;
        for client_id in self.client_ids() {
            let entry = self
                .entries
                .lock()
                .expect("local registry poisoned")
                .get(&client_id)
                .cloned();
            let Some((registration, auth_record)) = entry else {
                continue;
            };
            self.store.upsert(&registration, &auth_record).await?;
            republished += 1;
        }
        info!(instance_id = %self.store.instance_id(), republished, "local client registrations republished");
        Ok(republished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_camel_case_fields() {
        let reg = ClientRegistration::new("c1", "rc_a")
            .with_subscriptions(["records/demo"])
            .with_auth("users", "u1");
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(json["clientId"], "c1");
        assert_eq!(json["instanceId"], "rc_a");
        assert_eq!(json["subscriptions"][0], "records/demo");
        assert_eq!(json["authCollectionRef"], "users");
        assert_eq!(json["writerInstanceId"], "");
    }

    #[test]
    fn null_subscriptions_decode_as_empty() {
        let reg: ClientRegistration = serde_json::from_str(
            r#"{"clientId":"c1","instanceId":"rc_a","subscriptions":null}"#,
        )
        .unwrap();
        assert!(reg.subscriptions.is_empty());
        assert!(!reg.is_authenticated());
    }

    #[tokio::test]
    async fn republish_of_empty_registry_touches_nothing() {
        let local = LocalRegistry::new(RegistrationStore::new(
            crate::testing::lazy_pool(),
            "public",
            "rillcast_shared",
            InstanceId::parse("rc_a"),
        ));
        assert!(local.client_ids().is_empty());
        assert_eq!(local.republish().await.unwrap(), 0);
    }

    #[test]
    fn auth_comparison_ignores_topics() {
        let a = ClientRegistration::new("c1", "rc_a").with_auth("users", "u1");
        let b = a.clone().with_subscriptions(["x"]);
        assert!(a.same_auth(&b));
        assert!(!a.same_auth(&b.with_auth("users", "u2")));
    }
}
