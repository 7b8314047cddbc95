//! Governance daemon configuration (flags and environment).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::cgroup::Limits;
use crate::filter::Filter;
use crate::governor::GovernorConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "ffrtmp-governor")]
#[command(about = "ffrtmp governance daemon - cgroup limits for externally-launched encoders")]
#[command(version)]
pub struct GovernorArgs {
    /// Seconds between process-table scans.
    #[arg(long, env = "SCAN_INTERVAL_SECS", default_value_t = 10)]
    pub scan_interval_secs: u64,

    /// Command basenames to govern.
    #[arg(
        long = "target",
        env = "GOVERN_TARGETS",
        value_delimiter = ',',
        default_values_t = ["ffmpeg".to_string(), "gst-launch-1.0".to_string()]
    )]
    pub targets: Vec<String>,

    #[arg(long, env = "PROC_ROOT", default_value = "/proc")]
    pub proc_root: PathBuf,

    #[arg(long, env = "CGROUP_ROOT", default_value = "/sys/fs/cgroup")]
    pub cgroup_root: PathBuf,

    /// Advisory state file; restarts re-adopt tracked processes from it.
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Default memory ceiling per governed process, in bytes.
    #[arg(long, env = "MEMORY_MAX_BYTES")]
    pub memory_max_bytes: Option<u64>,

    /// CPU quota in microseconds per period.
    #[arg(long, env = "CPU_QUOTA_USEC")]
    pub cpu_quota_usec: Option<u64>,

    #[arg(long, env = "CPU_PERIOD_USEC")]
    pub cpu_period_usec: Option<u64>,

    /// Relative CPU weight (v2 semantics; translated to shares on v1).
    #[arg(long, env = "CPU_WEIGHT", default_value_t = 100)]
    pub cpu_weight: u64,

    /// JSON file with [`Filter`] rules (global and per-command).
    #[arg(long, env = "FILTER_FILE")]
    pub filter_file: Option<PathBuf>,

    /// Shortcut for the common case: skip processes younger than this.
    #[arg(long, env = "MIN_PROCESS_AGE_SECS")]
    pub min_process_age_secs: Option<u64>,
}

impl GovernorArgs {
    pub fn limits(&self) -> Limits {
        Limits {
            memory_max_bytes: self.memory_max_bytes,
            cpu_quota_usec: self.cpu_quota_usec,
            cpu_period_usec: self.cpu_period_usec,
            cpu_weight: Some(self.cpu_weight),
        }
    }

    pub fn filter(&self) -> Result<Filter> {
        let mut filter = match &self.filter_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read filter file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("malformed filter file {}", path.display()))?
            }
            None => Filter::default(),
        };
        if let Some(min_age) = self.min_process_age_secs {
            filter.default.min_age_secs.get_or_insert(min_age);
        }
        Ok(filter)
    }

    pub fn governor_config(&self) -> Result<GovernorConfig> {
        let mut config = GovernorConfig::new(self.targets.clone());
        config.scan_interval = Duration::from_secs(self.scan_interval_secs);
        config.proc_root = self.proc_root.clone();
        config.filter = self.filter()?;
        config.state_file = self.state_file.clone();
        Ok(config)
    }
}
