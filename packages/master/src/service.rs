//! Long-running service host.
//!
//! Every background task in the master (the three scheduler loops, the
//! HTTP server shutdown watcher) is a named [`Service`] driven by a shared
//! [`CancellationToken`]. Signals are handled in exactly one place, the
//! host; everything else only observes the token.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A named long-running task that runs until its token is cancelled.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Owns the shutdown token and supervises a set of services.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
            grace: Duration::from_secs(10),
        }
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token handle for cooperating tasks that are not full services
    /// (e.g. axum's graceful shutdown future).
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until SIGINT/SIGTERM (or an external cancellation
    /// of the token), then give them a grace period to wind down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let mut set = JoinSet::new();
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "service starting");
            set.spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                } else {
                    info!(service = name, "service stopped");
                }
            });
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                self.shutdown.cancel();
            }
        }

        // Loops finish their current iteration within the grace period or
        // get abandoned.
        if tokio::time::timeout(self.grace, async {
            while set.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(grace_secs = self.grace.as_secs(), "grace period exceeded, forcing exit");
            set.abort_all();
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
