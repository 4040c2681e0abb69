//! Lifecycle of the reconciliation pipeline and its query surface.

use std::sync::OnceLock;

use futures::{Stream, StreamExt};
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::classifier::{Classifier, EndpointResolver};
use crate::error::{BoxError, Error, Result};
use crate::handoff::{self, Handoff};
use crate::k8s::{KubeEndpointResolver, WatchConfig, service_notifications};
use crate::model::{ServiceNotification, ServiceStatus};
use crate::table::TunnelTable;
use crate::worker::{TunnelTransport, Worker};

/// Lifecycle phase of a [`Proxier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// `start` has not been called yet.
    Uninitialized,
    /// The transport and table are being built.
    Starting,
    /// Notifications are being reconciled into tunnels.
    Running,
    /// Shutdown was requested; pipeline tasks are finishing.
    Draining,
    /// Every pipeline task has finished.
    Stopped,
}

/// Keeps local tunnels in step with the services of a cluster.
///
/// The proxier is owned by the caller: share it (for instance in an `Arc`)
/// between the task driving [`start`](Self::start) and the tasks calling
/// [`list`](Self::list).
#[derive(Debug)]
pub struct Proxier {
    table: OnceLock<TunnelTable>,
    phase: watch::Sender<Phase>,
}

impl Default for Proxier {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxier {
    /// Creates a proxier that has not been started.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: OnceLock::new(),
            phase: watch::Sender::new(Phase::Uninitialized),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Watches the cluster behind `client` and reconciles its services into
    /// tunnels opened by the transport `build_transport` returns.
    ///
    /// Blocks until `shutdown` is cancelled and the pipeline has drained.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_in_cluster<T, F>(
        &self,
        client: Client,
        config: &WatchConfig,
        build_transport: F,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        T: TunnelTransport,
        F: FnOnce() -> std::result::Result<T, BoxError>,
    {
        let notifications = service_notifications(client.clone(), config);
        let resolver = KubeEndpointResolver::new(client);

        self.start(notifications, resolver, build_transport, shutdown)
            .await
    }

    /// Runs the pipeline over an arbitrary notification stream.
    ///
    /// Builds the transport and tunnel table, then runs the watcher pump, the
    /// classifier and the tunnel worker until `shutdown` is cancelled or the
    /// notification stream ends. Returns once all of them have finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once,
    /// [`Error::Setup`] if the transport cannot be built (nothing is started in
    /// that case), and [`Error::Task`] if a pipeline task panicked.
    pub async fn start<S, R, T, F>(
        &self,
        notifications: S,
        resolver: R,
        build_transport: F,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = ServiceNotification> + Send + 'static,
        R: EndpointResolver,
        T: TunnelTransport,
        F: FnOnce() -> std::result::Result<T, BoxError>,
    {
        let claimed = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Uninitialized {
                *phase = Phase::Starting;
                true
            } else {
                false
            }
        });

        if !claimed {
            return Err(Error::AlreadyStarted);
        }

        let transport = match build_transport() {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!("failed to set up tunnel transport: {e}");
                self.phase.send_replace(Phase::Uninitialized);
                return Err(Error::Setup(e));
            }
        };

        let table = self.table.get_or_init(TunnelTable::new).clone();
        let (notify, accepted_notifications) = handoff::channel();
        let (intents, accepted_intents) = handoff::channel();

        let worker = tokio::spawn(Worker::new(table, transport).run(accepted_intents));
        let classifier = tokio::spawn(Classifier::new(resolver).run(
            accepted_notifications,
            intents,
            shutdown.clone(),
        ));
        let watcher = tokio::spawn(pump(notifications, notify, shutdown.clone()));

        self.phase.send_replace(Phase::Running);
        tracing::info!("proxier running");

        let pipeline = async { tokio::join!(watcher, classifier, worker) };
        tokio::pin!(pipeline);

        let (watcher, classifier, worker) = tokio::select! {
            joined = &mut pipeline => joined,
            () = shutdown.cancelled() => {
                self.phase.send_replace(Phase::Draining);
                tracing::info!("proxier draining");
                pipeline.await
            }
        };

        self.phase.send_replace(Phase::Stopped);
        tracing::info!("proxier stopped");

        for (task, joined) in [
            ("watcher", watcher),
            ("classifier", classifier),
            ("worker", worker),
        ] {
            if let Err(source) = joined {
                tracing::error!("{task} task failed: {source}");
                return Err(Error::Task { task, source });
            }
        }

        Ok(())
    }

    /// Tunnels currently known, per service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] unless the proxier is running or draining.
    pub async fn list(&self) -> Result<Vec<ServiceStatus>> {
        if !matches!(self.phase(), Phase::Running | Phase::Draining) {
            return Err(Error::NotRunning);
        }

        let table = self.table.get().ok_or(Error::NotRunning)?;
        Ok(table.snapshot().await)
    }
}

/// Feeds watcher notifications to the classifier one at a time.
async fn pump<S>(
    notifications: S,
    notify: Handoff<ServiceNotification>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = ServiceNotification> + Send,
{
    tokio::pin!(notifications);

    loop {
        let notification = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            notification = notifications.next() => match notification {
                Some(notification) => notification,
                None => {
                    tracing::debug!("service watch ended");
                    break;
                }
            },
        };

        let sent = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            sent = notify.send(notification) => sent,
        };

        if sent.is_err() {
            tracing::warn!("classifier gone, stopping service watch");
            break;
        }
    }

    tracing::debug!("service watch stopped");
}
