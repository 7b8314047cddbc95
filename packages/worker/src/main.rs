// Main entry point for the ffrtmp worker agent.
//
// Exit codes: 0 clean, 1 configuration error, 2 fatal runtime error,
// 130 interrupted.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::agent::{self, AgentError};
use worker_core::config::WorkerArgs;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match WorkerArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version print to stdout and are clean exits; real
            // parse failures are configuration errors.
            let is_config_error = e.use_stderr();
            let _ = e.print();
            return if is_config_error {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(shutdown.clone(), interrupted.clone());

    match agent::run(args, shutdown).await {
        Ok(()) => {
            if interrupted.load(Ordering::Relaxed) {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(AgentError::Config(e)) => {
            tracing::error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(AgentError::Runtime(e)) => {
            if interrupted.load(Ordering::Relaxed) {
                ExitCode::from(130)
            } else {
                tracing::error!(error = %e, "fatal error");
                ExitCode::from(2)
            }
        }
    }
}

/// The only place raw signals are handled; everything else observes the
/// token.
fn spawn_signal_watcher(shutdown: CancellationToken, interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        interrupted.store(true, Ordering::Relaxed);
        shutdown.cancel();
    });
}
