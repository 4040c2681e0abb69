#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Local port-forwards that follow the services of a Kubernetes cluster.
//!
//! Developers working against a remote cluster want to reach its services by
//! their in-cluster names without hand-maintaining `kubectl port-forward`
//! sessions. This crate watches `Service` resources, works out which tunnels
//! each service needs and tells a pluggable tunnel transport to open or close
//! them, keeping a table of every tunnel and its status.
//!
//! # Features
//!
//! - **Service watch**: real-time add/delete notifications via a `Service` watch
//! - **Headless services**: one tunnel per ready pod, with per-pod DNS aliases
//! - **Backpressure**: every stage hands work to the next one synchronously,
//!   so a slow transport slows the watch down instead of queueing events
//! - **Status queries**: [`Proxier::list`] returns a consistent snapshot of
//!   every tunnel while reconciliation is in flight
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use kube::Client;
//! use kube_proxier::{Proxier, WatchConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::try_default().await?;
//! let proxier = Arc::new(Proxier::new());
//! let shutdown = CancellationToken::new();
//!
//! // MyTransport implements TunnelTransport
//! proxier
//!     .start_in_cluster(client, &WatchConfig::new(), || Ok(MyTransport::new()), shutdown)
//!     .await?;
//! ```

mod classifier;
mod error;
mod handoff;
mod k8s;
mod model;
mod proxier;
mod table;
mod worker;

pub use classifier::EndpointResolver;
pub use error::{BoxError, Error, Result};
pub use k8s::{KubeEndpointResolver, WatchConfig, service_notifications};
pub use model::{
    CreateIntent, DeleteIntent, EndpointTarget, NotificationKind, ServiceIdentity,
    ServiceNotification, ServiceStatus, Topology, TunnelEntry, TunnelIntent, TunnelState,
    TunnelStatus,
};
pub use proxier::{Phase, Proxier};
pub use table::StatusReporter;
pub use worker::TunnelTransport;
