// Main entry point for the ffrtmp governance daemon.
//
// Exit codes: 0 clean, 1 configuration error, 2 fatal runtime error,
// 130 interrupted.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use governor_core::cgroup::CgroupManager;
use governor_core::config::GovernorArgs;
use governor_core::governor::Governor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,governor_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match GovernorArgs::try_parse() {
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

    let config = match args.governor_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    tracing::info!(
        targets = ?config.targets,
        scan_interval_secs = config.scan_interval.as_secs(),
        "starting ffrtmp governor"
    );

    let cgroups = CgroupManager::detect(&args.cgroup_root, args.limits());
    let governor = Governor::new(config, cgroups);

    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(shutdown.clone(), interrupted.clone());

    match governor.run(shutdown).await {
        Ok(()) => {
            if interrupted.load(Ordering::Relaxed) {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}

/// Signals are handled here and nowhere else; the rest of the daemon only
/// reads the token.
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
