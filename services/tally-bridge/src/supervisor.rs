//! Supervisor owning one connection loop per configured device.
//!
//! Loops run for the life of the process. The supervisor holds the shared
//! shutdown signal; flipping it stops every loop at its next suspension point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::FleetAggregator;
use crate::connection::{ConnectionLoop, ConnectionSettings};
use crate::instance::Endpoint;

/// How long loops get to stop before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct SupervisedLoop {
    endpoint: Endpoint,
    handle: JoinHandle<()>,
}

/// Resolves once `shutdown` is set to `true` or its sender is dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Handle over the running fleet of connection loops.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<SupervisedLoop>,
}

impl Supervisor {
    /// Register every endpoint, publish the baseline aggregate and spawn the loops.
    ///
    /// A device listed more than once gets a single loop, keeping exactly one
    /// writer per instance state.
    pub async fn start(
        endpoints: Vec<Endpoint>,
        aggregator: Arc<FleetAggregator>,
        settings: ConnectionSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if seen.insert(endpoint.clone()) {
                unique.push(endpoint);
            } else {
                warn!(endpoint = %endpoint, "Ignoring duplicate endpoint");
            }
        }

        for endpoint in &unique {
            aggregator.register(endpoint.clone()).await;
        }
        aggregator.publish_baseline().await;

        let loops = unique
            .into_iter()
            .map(|endpoint| {
                let connection =
                    ConnectionLoop::new(endpoint.clone(), Arc::clone(&aggregator), settings);
                let handle = tokio::spawn(connection.run(shutdown_rx.clone()));
                SupervisedLoop { endpoint, handle }
            })
            .collect::<Vec<_>>();

        info!(count = loops.len(), "Started connection loops");

        Self { shutdown_tx, loops }
    }

    /// Receiver for the supervisor's shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Number of loops whose task has not finished.
    pub fn running_count(&self) -> usize {
        self.loops.iter().filter(|l| !l.handle.is_finished()).count()
    }

    /// Signal every loop to stop and wait for them, aborting stragglers.
    pub async fn shutdown(self) {
        info!(count = self.loops.len(), "Stopping connection loops");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for supervised in self.loops {
            let abort = supervised.handle.abort_handle();
            match tokio::time::timeout_at(deadline, supervised.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(endpoint = %supervised.endpoint, error = %e, "Connection loop panicked");
                }
                Err(_) => {
                    warn!(endpoint = %supervised.endpoint, "Force aborting connection loop");
                    abort.abort();
                }
            }
        }
    }

    /// Wait for every loop to exit. Without a shutdown signal this never returns.
    pub async fn wait(self) {
        for supervised in self.loops {
            if let Err(e) = supervised.handle.await {
                error!(endpoint = %supervised.endpoint, error = %e, "Connection loop panicked");
            }
        }
    }
}
