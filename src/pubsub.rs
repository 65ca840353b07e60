//! Postgres LISTEN/NOTIFY plumbing.
//!
//! [`NotificationListener`] is a reconnect-with-backoff loop around "listen on one
//! channel, hand every payload to a handler". It knows nothing about what the
//! payloads mean; the shared and direct routers are both built on it.

use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool, postgres::PgListener};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result, metrics::metrics};

/// Fire-and-forget NOTIFY. Inside a transaction the notification is only
/// delivered on commit.
pub async fn publish<'e, E>(executor: E, channel: &str, payload: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("select pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await?;
    Ok(())
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Runs once after every successful (re)subscription, before any message is
    /// delivered. May run many times over the process lifetime. An error here
    /// is treated like a connection failure: back off and start over.
    async fn on_reconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn on_message(&self, payload: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct NotificationListener {
    pool: PgPool,
    channel: String,
    retry_backoff: Duration,
}

impl NotificationListener {
    pub fn new(pool: PgPool, channel: impl Into<String>, retry_backoff: Duration) -> Self {
        Self {
            pool,
            channel: channel.into(),
            retry_backoff,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Never returns until `cancel` fires.
    pub async fn run<H>(&self, handler: &H, cancel: &CancellationToken)
    where
        H: NotificationHandler + ?Sized,
    {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.session(handler, cancel).await {
                Ok(()) => break,
                Err(err) => {
                    metrics()
                        .listener_reconnects_total
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %self.channel, error = %err, backoff_ms = self.retry_backoff.as_millis() as u64, "notification listener failed; retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.retry_backoff) => {}
            }
        }
        debug!(channel = %self.channel, "notification listener stopped");
    }

    /// One connection's lifetime. `Ok` only on cancellation.
    async fn session<H>(&self, handler: &H, cancel: &CancellationToken) -> Result<()>
    where
        H: NotificationHandler + ?Sized,
    {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!(channel = %self.channel, "listening");

        handler.on_reconnect().await?;

        loop {
            // `try_recv` surfaces a dropped connection as `None` instead of silently
            // reconnecting, so the handler gets a fresh `on_reconnect`.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = listener.try_recv() => next?,
            };
            let Some(notification) = next else {
                return Err(Error::ConnectionLost(self.channel.clone()));
            };
            if let Err(err) = handler.on_message(notification.payload()).await {
                error!(channel = %self.channel, error = %err, "notification handler failed");
            }
        }
    }
}
