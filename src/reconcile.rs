use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::info;

use crate::{
    Result,
    broker::AuthRecordLoader,
    metrics::metrics,
    proxy::{MirrorOutcome, ProxyRegistry},
    registry::{ClientRegistration, RegistrationStore},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub created: usize,
    pub updated: usize,
    pub pruned: usize,
}

/// Rebuilds the mirrored proxy set from `client_registrations`, repairing
/// whatever notifications were missed while disconnected.
pub struct Reconciler {
    store: RegistrationStore,
    proxies: Arc<ProxyRegistry>,
    auth: Arc<dyn AuthRecordLoader>,
}

impl Reconciler {
    pub fn new(
        store: RegistrationStore,
        proxies: Arc<ProxyRegistry>,
        auth: Arc<dyn AuthRecordLoader>,
    ) -> Self {
        Self {
            store,
            proxies,
            auth,
        }
    }

    /// Mirror every row we did not write ourselves, then drop every proxy with
    /// no backing row. Running it twice in a row changes nothing.
    pub async fn full_refresh(&self) -> Result<ReconcileReport> {
        let rows = self.store.list_foreign().await?;
        let mut report = ReconcileReport {
            scanned: rows.len(),
            ..ReconcileReport::default()
        };

        let mut target = HashSet::with_capacity(rows.len());
        for registration in rows {
            target.insert(registration.client_id.clone());
            let auth_record = self.auth_record_for(&registration).await?;
            match self.proxies.mirror(registration, auth_record) {
                MirrorOutcome::Created => report.created += 1,
                MirrorOutcome::Updated => report.updated += 1,
                MirrorOutcome::SkippedOwn | MirrorOutcome::SkippedLocal => {}
            }
        }
        report.pruned = self.proxies.retain(&target);

        metrics()
            .reconciliations_total
            .fetch_add(1, Ordering::Relaxed);
        info!(
            instance_id = %self.store.instance_id(),
            scanned = report.scanned,
            created = report.created,
            updated = report.updated,
            pruned = report.pruned,
            "reconciled bridged clients"
        );
        Ok(report)
    }

    /// Rows only carry refs. Keep the auth record we already mirror when the refs
    /// did not change; ask the loader otherwise.
    async fn auth_record_for(&self, registration: &ClientRegistration) -> Result<Value> {
        if let Some((current, auth_record)) = self.proxies.lookup(&registration.client_id)
            && current.same_auth(registration)
        {
            return Ok(auth_record);
        }
        if !registration.is_authenticated() {
            return Ok(Value::Null);
        }
        Ok(self
            .auth
            .load(
                &registration.auth_collection_ref,
                &registration.auth_record_ref,
            )
            .await?
            .unwrap_or(Value::Null))
    }
}
