//! Worker agent configuration (flags and environment).

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "ffrtmp-worker")]
#[command(about = "ffrtmp worker agent - pulls and executes transcoding jobs")]
#[command(version)]
pub struct WorkerArgs {
    /// Base URL of the master, e.g. http://master:8080
    #[arg(long, env = "MASTER_URL")]
    pub master_url: String,

    /// Human-readable worker name. Defaults to the hostname.
    #[arg(long, env = "WORKER_NAME")]
    pub name: Option<String>,

    /// Advertised address, unique across the cluster, e.g. 10.0.0.5:9000
    #[arg(long, env = "WORKER_ADDRESS")]
    pub address: String,

    /// Bearer token for master requests.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Executor pool size. Defaults to 75% of cores with a GPU present,
    /// 25% without.
    #[arg(long, env = "MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    /// Seconds between worker heartbeats.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Seconds between job polls.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Seconds between activity heartbeats for a running job.
    #[arg(long, env = "JOB_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub job_heartbeat_interval_secs: u64,

    /// Seconds to let in-flight jobs finish on shutdown before reporting
    /// them canceled.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Keep retrying registration when the address is held by a live
    /// worker instead of failing startup (the health loop frees it once
    /// the holder misses its heartbeats).
    #[arg(long, env = "TAKEOVER")]
    pub takeover: bool,

    /// Skip the runtime encoder probes and advertise software encoding
    /// only. For test rigs without ffmpeg installed.
    #[arg(long, env = "SKIP_ENCODER_PROBE")]
    pub skip_encoder_probe: bool,
}

impl WorkerArgs {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn job_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.job_heartbeat_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Executor pool sizing: GPU boxes are encoding-bound and take most of
/// the machine; CPU-only boxes leave headroom for the OS and probes.
pub fn default_max_concurrent(cores: usize, has_gpu: bool) -> usize {
    let share = if has_gpu { (cores * 3) / 4 } else { cores / 4 };
    share.max(1)
}
