//! Shared table of the tunnels currently known per service.
//!
//! The worker is the only writer of entry lists; the transport updates the
//! status of existing entries through a [`StatusReporter`], and any number of
//! readers may take snapshots at the same time.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{
    CreateIntent, EndpointTarget, ServiceIdentity, ServiceStatus, TunnelEntry, TunnelStatus,
};

type Entries = BTreeMap<ServiceIdentity, Vec<TunnelEntry>>;

/// Tunnel entries keyed by service identity.
#[derive(Clone, Debug, Default)]
pub(crate) struct TunnelTable {
    entries: Arc<RwLock<Entries>>,
}

impl TunnelTable {
    /// Creates an empty table.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a pending tunnel for `intent`.
    ///
    /// Returns `false` without touching the table if a tunnel for the same
    /// service and endpoint is already recorded.
    pub(crate) async fn insert(&self, intent: &CreateIntent) -> bool {
        let mut entries = self.entries.write().await;
        let tunnels = entries.entry(intent.service.clone()).or_default();

        if tunnels.iter().any(|t| t.endpoint == intent.endpoint) {
            return false;
        }

        tunnels.push(TunnelEntry {
            service: intent.service.clone(),
            endpoint: intent.endpoint.clone(),
            status: TunnelStatus::default(),
        });

        true
    }

    /// Removes every tunnel of `service`, returning what was removed.
    pub(crate) async fn remove(&self, service: &ServiceIdentity) -> Vec<TunnelEntry> {
        self.entries
            .write()
            .await
            .remove(service)
            .unwrap_or_default()
    }

    /// Removes every tunnel in the table.
    pub(crate) async fn drain(&self) -> Vec<TunnelEntry> {
        let drained = std::mem::take(&mut *self.entries.write().await);
        drained.into_values().flatten().collect()
    }

    /// Applies `update` to the status of one tunnel.
    ///
    /// Returns `false` if the tunnel is no longer in the table.
    pub(crate) async fn update_status<F>(
        &self,
        service: &ServiceIdentity,
        endpoint: Option<&EndpointTarget>,
        update: F,
    ) -> bool
    where
        F: FnOnce(&mut TunnelStatus),
    {
        let mut entries = self.entries.write().await;

        let entry = entries
            .get_mut(service)
            .and_then(|tunnels| tunnels.iter_mut().find(|t| t.endpoint.as_ref() == endpoint));

        match entry {
            Some(entry) => {
                update(&mut entry.status);
                true
            }
            None => false,
        }
    }

    /// Consistent copy of the whole table, ordered by service identity.
    pub(crate) async fn snapshot(&self) -> Vec<ServiceStatus> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(service, tunnels)| ServiceStatus {
                service: service.clone(),
                tunnels: tunnels.clone(),
            })
            .collect()
    }

    pub(crate) fn reporter(
        &self,
        service: ServiceIdentity,
        endpoint: Option<EndpointTarget>,
    ) -> StatusReporter {
        StatusReporter {
            table: self.clone(),
            service,
            endpoint,
        }
    }
}

/// Handle a transport uses to update the status of the tunnel it was asked
/// to open.
#[derive(Clone, Debug)]
pub struct StatusReporter {
    table: TunnelTable,
    service: ServiceIdentity,
    endpoint: Option<EndpointTarget>,
}

impl StatusReporter {
    /// Service the tunnel belongs to.
    #[must_use]
    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Pod the tunnel targets, for headless services.
    #[must_use]
    pub fn endpoint(&self) -> Option<&EndpointTarget> {
        self.endpoint.as_ref()
    }

    /// Replaces the tunnel's status.
    ///
    /// Returns `false` once the tunnel has been removed from the table, which
    /// tells the transport to stop reporting.
    pub async fn report(&self, status: TunnelStatus) -> bool {
        self.update(|current| *current = status).await
    }

    /// Modifies the tunnel's status in place.
    ///
    /// Returns `false` once the tunnel has been removed from the table.
    pub async fn update<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut TunnelStatus),
    {
        self.table
            .update_status(&self.service, self.endpoint.as_ref(), update)
            .await
    }
}

#[cfg(test)]
impl TunnelTable {
    /// Tunnels currently recorded for `service`.
    pub(crate) async fn tunnels(&self, service: &ServiceIdentity) -> Vec<TunnelEntry> {
        self.entries
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}
