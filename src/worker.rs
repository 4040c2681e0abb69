//! Applies tunnel intents to the table and the transport.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::handoff::Accept;
use crate::model::{
    CreateIntent, DeleteIntent, EndpointTarget, ServiceIdentity, TunnelIntent, TunnelState,
};
use crate::table::{StatusReporter, TunnelTable};

/// The component that actually moves bytes for a tunnel.
///
/// Implementations should return from both methods promptly and do long
/// running work on their own tasks: intents are applied one at a time, so a
/// slow transport holds up every later cluster event.
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    /// Starts establishing the tunnel described by `intent`.
    ///
    /// `status` stays valid until the tunnel is closed; updates made through
    /// it show up in [`Proxier::list`](crate::Proxier::list).
    ///
    /// # Errors
    ///
    /// An error marks the tunnel as failed. It stays listed until its service
    /// is deleted.
    async fn open(&self, intent: &CreateIntent, status: StatusReporter) -> Result<(), BoxError>;

    /// Tears down the tunnel previously opened for `service` and `endpoint`.
    async fn close(&self, service: &ServiceIdentity, endpoint: Option<&EndpointTarget>);
}

/// Single writer of the tunnel table.
pub(crate) struct Worker<T> {
    table: TunnelTable,
    transport: T,
}

impl<T: TunnelTransport> Worker<T> {
    pub(crate) fn new(table: TunnelTable, transport: T) -> Self {
        Self { table, transport }
    }

    /// Applies intents until the classifier goes away, then closes whatever
    /// is still open.
    pub(crate) async fn run(self, mut intents: Accept<TunnelIntent>) {
        while let Some(intent) = intents.recv().await {
            self.apply(intent).await;
        }

        let remaining = self.table.drain().await;
        tracing::debug!("tunnel worker stopping, closing {} tunnels", remaining.len());

        for entry in remaining {
            self.transport
                .close(&entry.service, entry.endpoint.as_ref())
                .await;
        }
    }

    pub(crate) async fn apply(&self, intent: TunnelIntent) {
        match intent {
            TunnelIntent::Create(create) => self.create(create).await,
            TunnelIntent::Delete(delete) => self.delete(delete).await,
        }
    }

    async fn create(&self, intent: CreateIntent) {
        if !self.table.insert(&intent).await {
            tracing::debug!(
                "tunnel for {} ({:?}) already exists, ignoring",
                intent.service,
                intent.endpoint
            );
            return;
        }

        tracing::debug!("opening tunnel for {} ({:?})", intent.service, intent.endpoint);

        let reporter = self
            .table
            .reporter(intent.service.clone(), intent.endpoint.clone());

        if let Err(e) = self.transport.open(&intent, reporter.clone()).await {
            tracing::warn!("failed to open tunnel for {}: {e}", intent.service);
            reporter
                .update(|status| {
                    status.state = TunnelState::Failed;
                    status.last_error = Some(e.to_string());
                })
                .await;
        }
    }

    async fn delete(&self, intent: DeleteIntent) {
        let removed = self.table.remove(&intent.service).await;

        if removed.is_empty() {
            tracing::debug!("no tunnels for {}, nothing to delete", intent.service);
            return;
        }

        tracing::debug!("closing {} tunnels for {}", removed.len(), intent.service);

        for entry in removed {
            self.transport
                .close(&entry.service, entry.endpoint.as_ref())
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::handoff;
    use crate::model::{Topology, TunnelStatus};

    /// What a [`RecordingTransport`] was asked to do.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Call {
        Open(ServiceIdentity, Option<EndpointTarget>),
        Close(ServiceIdentity, Option<EndpointTarget>),
    }

    /// Transport that records calls and marks tunnels active.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) calls: Arc<Mutex<Vec<Call>>>,
        pub(crate) fail: bool,
    }

    impl RecordingTransport {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelTransport for RecordingTransport {
        async fn open(
            &self,
            intent: &CreateIntent,
            status: StatusReporter,
        ) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(Call::Open(
                intent.service.clone(),
                intent.endpoint.clone(),
            ));

            if self.fail {
                return Err("connection refused".into());
            }

            status
                .report(TunnelStatus {
                    state: TunnelState::Active,
                    last_error: None,
                    local_address: None,
                })
                .await;

            Ok(())
        }

        async fn close(&self, service: &ServiceIdentity, endpoint: Option<&EndpointTarget>) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Close(service.clone(), endpoint.cloned()));
        }
    }

    fn web() -> ServiceIdentity {
        ServiceIdentity::new("web", "default", Topology::Ordinary)
    }

    fn db() -> ServiceIdentity {
        ServiceIdentity::new("db", "ns", Topology::Decentralized)
    }

    fn create(service: ServiceIdentity, pod: Option<&str>) -> TunnelIntent {
        let endpoint = pod.map(|p| EndpointTarget::new(p, service.namespace.clone()));
        TunnelIntent::Create(CreateIntent {
            hostnames: service.hostnames(endpoint.as_ref()),
            ports: vec![80],
            service,
            endpoint,
        })
    }

    fn delete(service: ServiceIdentity) -> TunnelIntent {
        TunnelIntent::Delete(DeleteIntent { service })
    }

    #[tokio::test]
    async fn create_opens_tunnel_and_records_status() {
        let table = TunnelTable::new();
        let transport = RecordingTransport::default();
        let worker = Worker::new(table.clone(), transport.clone());

        worker.apply(create(web(), None)).await;

        assert_eq!(transport.calls(), vec![Call::Open(web(), None)]);
        let tunnels = table.tunnels(&web()).await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].status.state, TunnelState::Active);
    }

    #[tokio::test]
    async fn failed_open_marks_tunnel_failed() {
        let table = TunnelTable::new();
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let worker = Worker::new(table.clone(), transport);

        worker.apply(create(web(), None)).await;

        let tunnels = table.tunnels(&web()).await;
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].status.state, TunnelState::Failed);
        assert_eq!(
            tunnels[0].status.last_error.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_ignored() {
        let table = TunnelTable::new();
        let transport = RecordingTransport::default();
        let worker = Worker::new(table.clone(), transport.clone());

        worker.apply(create(web(), None)).await;
        worker.apply(create(web(), None)).await;

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(table.tunnels(&web()).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_closes_every_tunnel_of_service() {
        let table = TunnelTable::new();
        let transport = RecordingTransport::default();
        let worker = Worker::new(table.clone(), transport.clone());

        worker.apply(create(db(), Some("pod-0"))).await;
        worker.apply(create(db(), Some("pod-1"))).await;
        worker.apply(delete(db())).await;

        assert!(table.tunnels(&db()).await.is_empty());
        let closes: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Close(..)))
            .collect();
        assert_eq!(
            closes,
            vec![
                Call::Close(db(), Some(EndpointTarget::new("pod-0", "ns"))),
                Call::Close(db(), Some(EndpointTarget::new("pod-1", "ns"))),
            ]
        );
    }

    #[tokio::test]
    async fn delete_of_unknown_service_is_noop() {
        let table = TunnelTable::new();
        let transport = RecordingTransport::default();
        let worker = Worker::new(table.clone(), transport.clone());

        worker.apply(delete(web())).await;
        worker.apply(delete(web())).await;

        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn run_closes_remaining_tunnels_on_exit() {
        let table = TunnelTable::new();
        let transport = RecordingTransport::default();
        let worker = Worker::new(table.clone(), transport.clone());
        let (tx, rx) = handoff::channel();

        let handle = tokio::spawn(worker.run(rx));
        tx.send(create(web(), None)).await.unwrap();
        tx.send(create(db(), Some("pod-0"))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(table.snapshot().await.is_empty());
        let calls = transport.calls();
        assert!(calls.contains(&Call::Close(web(), None)));
        assert!(calls.contains(&Call::Close(db(), Some(EndpointTarget::new("pod-0", "ns")))));
    }
}
