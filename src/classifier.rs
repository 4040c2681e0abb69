//! Turns service notifications into tunnel intents.
//!
//! Notifications are classified one at a time, in arrival order, so intents
//! for the same service are never reordered. The only I/O on this path is the
//! endpoint lookup for headless services.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::handoff::{Accept, Handoff};
use crate::model::{
    CreateIntent, DeleteIntent, EndpointTarget, NotificationKind, ServiceIdentity,
    ServiceNotification, Topology, TunnelIntent,
};

/// Name of the cluster's own API service, which is never forwarded.
const RESERVED_SERVICE_NAME: &str = "kubernetes";

/// Looks up the pods behind a headless service.
#[async_trait]
pub trait EndpointResolver: Send + Sync + 'static {
    /// Returns one target per ready address backed by a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails; the service's tunnels are then
    /// skipped until it is added again.
    async fn resolve(&self, service: &ServiceIdentity) -> Result<Vec<EndpointTarget>, BoxError>;
}

/// Serial consumer of service notifications.
pub(crate) struct Classifier<R> {
    resolver: R,
}

impl<R: EndpointResolver> Classifier<R> {
    pub(crate) fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Classifies notifications until the watcher goes away, the worker goes
    /// away, or `shutdown` fires.
    pub(crate) async fn run(
        self,
        mut notifications: Accept<ServiceNotification>,
        intents: Handoff<TunnelIntent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let notification = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => notification,
                    None => break,
                },
            };

            let classified = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                classified = self.classify(&notification) => classified,
            };

            for intent in classified {
                let service = intent.service().clone();

                let sent = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    sent = intents.send(intent) => sent,
                };

                if sent.is_err() {
                    tracing::warn!("tunnel worker gone, stopping classifier");
                    return;
                }

                tracing::debug!("intent for {service} handed off");
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        tracing::debug!("classifier stopped");
    }

    /// Intents produced by one notification.
    pub(crate) async fn classify(&self, notification: &ServiceNotification) -> Vec<TunnelIntent> {
        let Some(service) = ServiceIdentity::from_service(&notification.service) else {
            tracing::warn!("ignoring service notification without a name");
            return Vec::new();
        };

        if service.name == RESERVED_SERVICE_NAME {
            tracing::debug!("skipping reserved service {service}");
            return Vec::new();
        }

        match notification.kind {
            NotificationKind::Added => {
                let ports = declared_ports(&notification.service);
                self.created(service, ports).await
            }
            NotificationKind::Deleted => vec![TunnelIntent::Delete(DeleteIntent { service })],
        }
    }

    async fn created(&self, service: ServiceIdentity, ports: Vec<u16>) -> Vec<TunnelIntent> {
        match service.topology {
            Topology::Ordinary => vec![TunnelIntent::Create(CreateIntent {
                hostnames: service.hostnames(None),
                service,
                ports,
                endpoint: None,
            })],

            Topology::Decentralized => {
                let pods = match self.resolver.resolve(&service).await {
                    Ok(pods) => pods,
                    Err(e) => {
                        tracing::warn!("failed to resolve endpoints for {service}, skipping: {e}");
                        return Vec::new();
                    }
                };

                tracing::debug!("{service} resolved to {} pods", pods.len());

                pods.into_iter()
                    .map(|pod| {
                        TunnelIntent::Create(CreateIntent {
                            hostnames: service.hostnames(Some(&pod)),
                            service: service.clone(),
                            ports: ports.clone(),
                            endpoint: Some(pod),
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Port numbers declared by a service, in declaration order.
fn declared_ports(service: &Service) -> Vec<u16> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|port| u16::try_from(port.port).ok())
        .collect()
}
