//! Data model shared by the classifier, the tunnel table and the transport.

use std::fmt;
use std::net::SocketAddr;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

/// Cluster IP value Kubernetes assigns to headless services.
const HEADLESS_CLUSTER_IP: &str = "None";

/// Namespace assumed when a service carries none.
pub(crate) const DEFAULT_NAMESPACE: &str = "default";

/// How traffic reaches a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topology {
    /// Routed through the service's single virtual address.
    Ordinary,
    /// Headless: no virtual address, traffic goes to individual pods.
    Decentralized,
}

/// Stable key for all tunnel bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    /// Service name.
    pub name: String,
    /// Service namespace.
    pub namespace: String,
    /// Service topology.
    pub topology: Topology,
}

impl ServiceIdentity {
    /// Creates an identity from its parts.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, topology: Topology) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            topology,
        }
    }

    /// Derives the identity of a `Service` resource.
    ///
    /// Returns `None` for a service without a name.
    #[must_use]
    pub fn from_service(service: &Service) -> Option<Self> {
        let name = service.metadata.name.clone()?;
        let namespace = service
            .namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let headless = service
            .spec
            .as_ref()
            .and_then(|spec| spec.cluster_ip.as_deref())
            == Some(HEADLESS_CLUSTER_IP);

        let topology = if headless {
            Topology::Decentralized
        } else {
            Topology::Ordinary
        };

        Some(Self {
            name,
            namespace,
            topology,
        })
    }

    /// Progressively qualified DNS aliases for this service.
    ///
    /// For a pod behind a headless service the qualified forms are rooted at
    /// `<pod>.<service>`; the bare service name always comes first.
    #[must_use]
    pub fn hostnames(&self, endpoint: Option<&EndpointTarget>) -> Vec<String> {
        let root = match endpoint {
            Some(pod) => format!("{}.{}", pod.name, self.name),
            None => self.name.clone(),
        };
        let qualified = format!("{root}.{}", self.namespace);

        vec![
            self.name.clone(),
            qualified.clone(),
            format!("{qualified}.svc"),
            format!("{qualified}.svc.cluster"),
            format!("{qualified}.svc.cluster.local"),
        ]
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What happened to a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// The service appeared in the cluster.
    Added,
    /// The service was removed from the cluster.
    Deleted,
}

/// A service lifecycle notification produced by the watcher.
#[derive(Clone, Debug)]
pub struct ServiceNotification {
    /// Kind of change.
    pub kind: NotificationKind,
    /// The service as last observed.
    pub service: Service,
}

impl ServiceNotification {
    /// Notification for a newly observed service.
    #[must_use]
    pub fn added(service: Service) -> Self {
        Self {
            kind: NotificationKind::Added,
            service,
        }
    }

    /// Notification for a removed service.
    #[must_use]
    pub fn deleted(service: Service) -> Self {
        Self {
            kind: NotificationKind::Deleted,
            service,
        }
    }
}

/// One backing pod of a headless service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointTarget {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
}

impl EndpointTarget {
    /// Creates a pod target.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Request to open one tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateIntent {
    /// Owning service.
    pub service: ServiceIdentity,
    /// Remote ports, in declaration order.
    pub ports: Vec<u16>,
    /// Target pod, for headless services.
    pub endpoint: Option<EndpointTarget>,
    /// Hostname aliases the tunnel should answer to.
    pub hostnames: Vec<String>,
}

/// Request to tear down every tunnel of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteIntent {
    /// Service whose tunnels are removed.
    pub service: ServiceIdentity,
}

/// Output of the classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelIntent {
    /// Open a tunnel.
    Create(CreateIntent),
    /// Close all tunnels of a service.
    Delete(DeleteIntent),
}

impl TunnelIntent {
    /// The service this intent is about.
    #[must_use]
    pub fn service(&self) -> &ServiceIdentity {
        match self {
            Self::Create(create) => &create.service,
            Self::Delete(delete) => &delete.service,
        }
    }
}

/// Connection state of a tunnel as reported by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TunnelState {
    /// Recorded but not yet picked up by the transport.
    #[default]
    Pending,
    /// The transport is establishing the connection.
    Connecting,
    /// Traffic can flow.
    Active,
    /// The transport gave up or lost the connection.
    Failed,
}

/// Status record of one tunnel, maintained by the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelStatus {
    /// Connection state.
    pub state: TunnelState,
    /// Most recent error, if any.
    pub last_error: Option<String>,
    /// Local address the tunnel is bound to.
    pub local_address: Option<SocketAddr>,
}

/// One active or pending tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelEntry {
    /// Owning service.
    pub service: ServiceIdentity,
    /// Target pod, for headless services.
    pub endpoint: Option<EndpointTarget>,
    /// Current status.
    pub status: TunnelStatus,
}

/// Point-in-time view of the tunnels of one service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    /// The service.
    pub service: ServiceIdentity,
    /// Its tunnels, in creation order.
    pub tunnels: Vec<TunnelEntry>,
}

impl ServiceStatus {
    /// Statuses of the service's tunnels, in creation order.
    pub fn statuses(&self) -> impl Iterator<Item = &TunnelStatus> {
        self.tunnels.iter().map(|tunnel| &tunnel.status)
    }
}
