use anyhow::Result;
use rillcast::lease::LeaseStore;
use rillcast::registry::{ClientRegistration, RegistrationStore};
use rillcast::{InstanceId, SchemaConfig, SchemaManager};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::{Duration, timeout};

const SHARED: &str = "rillcast_shared";

async fn start_postgres() -> Result<(ContainerAsync<GenericImage>, String)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");
    Ok((container, url))
}

async fn setup() -> Result<(ContainerAsync<GenericImage>, PgPool)> {
    let (container, url) = start_postgres().await?;
    let pool = PgPool::connect(&url).await?;
    rillcast::testing::migrate_bridge_schema(&pool).await?;
    Ok((container, pool))
}

async fn expire(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query(
        "update instance_leases set valid_until = now() - interval '1 second' where instance_id = $1",
    )
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[tokio::test]
async fn schema_sync_is_idempotent() -> Result<()> {
    let (_container, pool) = setup().await?;
    let plan = SchemaManager::new(pool.clone())
        .plan(&SchemaConfig::default())
        .await?;
    assert!(plan.is_empty(), "unexpected actions: {:?}", plan.actions());

    let other = SchemaConfig::new("bridge");
    let first = SchemaManager::new(pool.clone()).sync(&other).await?;
    assert_eq!(first.actions().len(), 4);
    let second = SchemaManager::new(pool).sync(&other).await?;
    assert!(second.is_empty());
    Ok(())
}

#[tokio::test]
async fn heartbeat_reaps_expired_peers_and_announces_them() -> Result<()> {
    let (_container, pool) = setup().await?;
    let a = InstanceId::parse("rc_a");
    let dead = InstanceId::parse("rc_dead");
    let leases = LeaseStore::new(pool.clone(), "public", SHARED);
    let ttl = Duration::from_secs(40);

    leases.heartbeat(&dead, ttl).await?;
    let dead_store = RegistrationStore::new(pool.clone(), "public", SHARED, dead.clone());
    dead_store
        .upsert(&ClientRegistration::new("x1", dead.as_str()), &json!(null))
        .await?;
    dead_store
        .upsert(&ClientRegistration::new("x2", dead.as_str()), &json!(null))
        .await?;
    expire(&pool, dead.as_str()).await?;

    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(SHARED).await?;

    let reaped = leases.heartbeat(&a, ttl).await?;
    assert_eq!(reaped, vec!["rc_dead".to_string()]);

    assert!(leases.get("rc_dead").await?.is_none());
    let own = leases.get("rc_a").await?.expect("own lease");
    assert!(!own.is_expired_at(chrono::Utc::now()));
    assert!(dead_store.list_by_instance("rc_dead").await?.is_empty());

    let notification = timeout(Duration::from_secs(5), listener.recv()).await??;
    assert_eq!(notification.payload(), "subscription_channel_offline|rc_dead");

    // a second beat finds nothing left to reap
    assert!(leases.heartbeat(&a, ttl).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn own_expired_lease_is_renewed_not_reaped() -> Result<()> {
    let (_container, pool) = setup().await?;
    let a = InstanceId::parse("rc_a");
    let leases = LeaseStore::new(pool.clone(), "public", SHARED);
    leases.heartbeat(&a, Duration::from_secs(40)).await?;
    expire(&pool, a.as_str()).await?;

    let reaped = leases.heartbeat(&a, Duration::from_secs(40)).await?;
    assert!(reaped.is_empty());
    let own = leases.get("rc_a").await?.expect("own lease");
    assert!(!own.is_expired_at(chrono::Utc::now()));
    Ok(())
}

#[tokio::test]
async fn release_drops_lease_and_registrations() -> Result<()> {
    let (_container, pool) = setup().await?;
    let a = InstanceId::parse("rc_a");
    let leases = LeaseStore::new(pool.clone(), "public", SHARED);
    let store = RegistrationStore::new(pool.clone(), "public", SHARED, a.clone());
    leases.heartbeat(&a, Duration::from_secs(40)).await?;
    store
        .upsert(
            &ClientRegistration::new("x1", a.as_str()).with_subscriptions(["records/demo"]),
            &json!(null),
        )
        .await?;

    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(SHARED).await?;

    assert_eq!(leases.release(&a).await?, 1);
    assert!(leases.list().await?.is_empty());
    assert!(store.list_all().await?.is_empty());

    let notification = timeout(Duration::from_secs(5), listener.recv()).await??;
    assert_eq!(notification.payload(), "subscription_channel_offline|rc_a");
    Ok(())
}

#[tokio::test]
async fn registration_writes_are_announced_on_commit() -> Result<()> {
    let (_container, pool) = setup().await?;
    let a = InstanceId::parse("rc_a");
    let store = RegistrationStore::new(pool.clone(), "public", SHARED, a.clone());

    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(SHARED).await?;

    let registration = ClientRegistration::new("x1", a.as_str())
        .with_subscriptions(["records/demo", "records/other"])
        .with_auth("users", "u1");
    let stamped = store.upsert(&registration, &json!({"id": "u1"})).await?;
    assert_eq!(stamped.writer_instance_id, "rc_a");
    assert_eq!(store.get("x1").await?, Some(stamped.clone()));

    let upsert = timeout(Duration::from_secs(5), listener.recv()).await??;
    assert!(upsert.payload().starts_with("subscription_upsert|{"));

    assert!(store.delete("x1").await?);
    let delete = timeout(Duration::from_secs(5), listener.recv()).await??;
    assert_eq!(delete.payload(), "subscription_delete|x1");

    // deleting a missing row announces nothing
    assert!(!store.delete("x1").await?);
    assert!(
        timeout(Duration::from_millis(300), listener.recv())
            .await
            .is_err()
    );
    Ok(())
}
