//! Runs the proxier against the current kube context and logs its tunnels.
//!
//! The transport here only pretends to open tunnels: it marks each one active
//! and logs the hostnames it would answer to. Swap in a real transport to
//! actually forward traffic.
//!
//! # Environment Variables
//!
//! - `WATCH_NAMESPACE`: namespace to watch (default: all namespaces)
//! - `WATCH_LABELS`: label selector for services (default: none)
//! - `LIST_INTERVAL_SECS`: seconds between status dumps (default: 5)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use kube_proxier::{
    BoxError, CreateIntent, EndpointTarget, Proxier, ServiceIdentity, StatusReporter,
    TunnelState, TunnelStatus, TunnelTransport, WatchConfig,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

/// Transport that logs instead of forwarding.
struct LoggingTransport;

#[async_trait]
impl TunnelTransport for LoggingTransport {
    async fn open(&self, intent: &CreateIntent, status: StatusReporter) -> Result<(), BoxError> {
        info!(
            "open {} ports {:?} as {}",
            intent.service,
            intent.ports,
            intent.hostnames.join(", ")
        );

        status
            .report(TunnelStatus {
                state: TunnelState::Active,
                ..Default::default()
            })
            .await;

        Ok(())
    }

    async fn close(&self, service: &ServiceIdentity, endpoint: Option<&EndpointTarget>) {
        match endpoint {
            Some(pod) => info!("close {service} via {pod}"),
            None => info!("close {service}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    // Read configuration from environment
    let mut config = WatchConfig::new();
    if let Ok(namespace) = env::var("WATCH_NAMESPACE") {
        config = config.namespace(namespace);
    }
    if let Ok(labels) = env::var("WATCH_LABELS") {
        config = config.labels(labels);
    }
    let interval: u64 = env::var("LIST_INTERVAL_SECS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(5);

    let client = Client::try_default().await?;
    let proxier = Arc::new(Proxier::new());
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
            shutdown.cancel();
        }
    });

    tokio::spawn({
        let proxier = proxier.clone();
        async move {
            loop {
                sleep(Duration::from_secs(interval)).await;

                let Ok(services) = proxier.list().await else {
                    continue;
                };

                info!("=== {} services ===", services.len());
                for service in &services {
                    let states: Vec<_> = service
                        .statuses()
                        .map(|s| format!("{:?}", s.state))
                        .collect();
                    info!("{}: [{}]", service.service, states.join(", "));
                }
            }
        }
    });

    proxier
        .start_in_cluster(client, &config, || Ok(LoggingTransport), shutdown)
        .await?;

    Ok(())
}
