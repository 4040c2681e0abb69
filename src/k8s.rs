//! Kubernetes-facing side of the proxier: the `Service` watch and endpoint
//! resolution for headless services.
//!
//! # How It Works
//!
//! 1. Watches `Service` resources across the cluster (or one namespace)
//! 2. Keeps the last-seen copy of every service to tell additions from updates
//! 3. Yields `Added` for services seen for the first time and `Deleted` for
//!    services that were removed, including ones that vanished while the
//!    watch was re-listing
//! 4. Resolves the ready pods behind a headless service from its `Endpoints`

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client, ResourceExt};

use crate::classifier::EndpointResolver;
use crate::error::BoxError;
use crate::model::{DEFAULT_NAMESPACE, EndpointTarget, ServiceIdentity, ServiceNotification};

/// Target reference kind of endpoint addresses backed by a pod.
const POD_KIND: &str = "Pod";

/// Configuration for the `Service` watch.
#[derive(Clone, Debug, Default)]
pub struct WatchConfig {
    /// Namespace to watch. If `None`, services in all namespaces are watched.
    pub namespace: Option<String>,

    /// Label selector restricting which services are watched.
    pub label_selector: Option<String>,
}

impl WatchConfig {
    /// Creates a configuration watching every service in the cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the watch to one namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restricts the watch to services matching a label selector.
    #[must_use]
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// Watches `Service` resources and yields add/delete notifications.
///
/// Watch errors are logged and retried with kube's default backoff, so the
/// stream only ends if the underlying watch does.
pub fn service_notifications(
    client: Client,
    config: &WatchConfig,
) -> impl Stream<Item = ServiceNotification> + Send + 'static {
    let services: Api<Service> = match &config.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    let mut watcher_config = WatcherConfig::default();
    if let Some(selector) = &config.label_selector {
        watcher_config = watcher_config.labels(selector);
    }

    tracing::debug!(
        "Starting Kubernetes service watch in {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );

    let mut cache = ServiceCache::default();

    watcher::watcher(services, watcher_config)
        .default_backoff()
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Kubernetes service watch error: {e}");
                    None
                }
            })
        })
        .flat_map(move |event| stream::iter(process_event(&event, &mut cache)))
}

/// Namespace and name of a service.
type ObjectKey = (String, String);

fn object_key(service: &Service) -> ObjectKey {
    let namespace = service
        .namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    (namespace, service.name_any())
}

/// Services seen so far by the watch.
#[derive(Debug, Default)]
struct ServiceCache {
    known: HashMap<ObjectKey, Service>,
    /// Services seen since the current re-list started.
    relisted: Option<HashSet<ObjectKey>>,
}

/// Processes a watcher event and returns the resulting notifications.
fn process_event(event: &Event<Service>, cache: &mut ServiceCache) -> Vec<ServiceNotification> {
    match event {
        Event::Apply(service) => observe(service, cache).into_iter().collect(),

        Event::InitApply(service) => {
            if let Some(relisted) = cache.relisted.as_mut() {
                relisted.insert(object_key(service));
            }

            observe(service, cache).into_iter().collect()
        }

        Event::Delete(service) => {
            let key = object_key(service);

            if cache.known.remove(&key).is_some() {
                tracing::debug!("service deleted: {}/{}", key.0, key.1);
                vec![ServiceNotification::deleted(service.clone())]
            } else {
                Vec::new()
            }
        }

        Event::Init => {
            tracing::debug!("Kubernetes service watch (re)listing");
            cache.relisted = Some(HashSet::new());
            Vec::new()
        }

        Event::InitDone => {
            let Some(relisted) = cache.relisted.take() else {
                return Vec::new();
            };

            let mut stale: Vec<ObjectKey> = cache
                .known
                .keys()
                .filter(|key| !relisted.contains(*key))
                .cloned()
                .collect();
            stale.sort();

            tracing::debug!(
                "Kubernetes service watch listed {} services, {} gone",
                relisted.len(),
                stale.len()
            );

            stale
                .into_iter()
                .filter_map(|key| cache.known.remove(&key))
                .map(ServiceNotification::deleted)
                .collect()
        }
    }
}

/// Records `service`, returning an `Added` notification if it is new.
fn observe(service: &Service, cache: &mut ServiceCache) -> Option<ServiceNotification> {
    let key = object_key(service);

    if cache.known.insert(key.clone(), service.clone()).is_some() {
        return None;
    }

    tracing::debug!("service added: {}/{}", key.0, key.1);
    Some(ServiceNotification::added(service.clone()))
}

/// Resolves headless service pods from core/v1 `Endpoints`.
#[derive(Clone)]
pub struct KubeEndpointResolver {
    client: Client,
}

impl KubeEndpointResolver {
    /// Creates a resolver using `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointResolver for KubeEndpointResolver {
    async fn resolve(&self, service: &ServiceIdentity) -> Result<Vec<EndpointTarget>, BoxError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        let endpoints = api.get(&service.name).await?;

        Ok(pod_targets(&endpoints, &service.namespace))
    }
}

/// Extracts the pods behind the ready addresses of an `Endpoints` object.
///
/// Addresses without a pod back-reference are skipped.
fn pod_targets(endpoints: &Endpoints, namespace: &str) -> Vec<EndpointTarget> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|address| {
            let target = address.target_ref.as_ref()?;

            if target.kind.as_deref() != Some(POD_KIND) {
                return None;
            }

            Some(EndpointTarget {
                name: target.name.clone()?,
                namespace: target
                    .namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string()),
            })
        })
        .collect()
}
