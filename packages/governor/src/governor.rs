//! The governance core: scan, filter, attach, monitor.
//!
//! Non-owning by construction: the daemon never signals a governed
//! process, never touches anything but cgroup files, and leaves cgroups
//! in place on shutdown. Monitors watch for process exit by polling the
//! process table, because a process we did not spawn cannot be waited on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cgroup::{Attachment, CgroupManager};
use crate::filter::Filter;
use crate::health::{HealthStatus, HealthTracker};
use crate::scan::{self, ProcessInfo};
use crate::state::{self, PersistedState, TrackedProcess};

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub scan_interval: Duration,
    /// Command basenames to govern, e.g. `ffmpeg`, `gst-launch-1.0`.
    pub targets: Vec<String>,
    pub proc_root: PathBuf,
    pub filter: Filter,
    pub state_file: Option<PathBuf>,
    /// How often exit monitors re-check the process table.
    pub monitor_poll: Duration,
    /// Our own PID; candidates descending from it are never governed.
    pub self_pid: i32,
}

impl GovernorConfig {
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            targets,
            proc_root: PathBuf::from("/proc"),
            filter: Filter::default(),
            state_file: None,
            monitor_poll: Duration::from_secs(1),
            self_pid: std::process::id() as i32,
        }
    }
}

/// Counters behind their own lock so readers never contend with a scan
/// holding the tracked-set lock.
#[derive(Debug, Default)]
pub struct Stats {
    pub scans: u64,
    pub attached_total: u64,
    pub exited_total: u64,
    pub health: HealthTracker,
}

#[derive(Clone)]
pub struct Governor {
    config: Arc<GovernorConfig>,
    cgroups: Arc<CgroupManager>,
    tracked: Arc<Mutex<HashMap<i32, TrackedProcess>>>,
    stats: Arc<Mutex<Stats>>,
}

impl Governor {
    pub fn new(config: GovernorConfig, cgroups: CgroupManager) -> Self {
        let restored = config
            .state_file
            .as_deref()
            .map(state::load)
            .unwrap_or_default();
        Self {
            config: Arc::new(config),
            cgroups: Arc::new(cgroups),
            tracked: Arc::new(Mutex::new(restored.tracked)),
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        self.stats.lock().await.health.status()
    }

    pub async fn tracked_pids(&self) -> Vec<i32> {
        self.tracked.lock().await.keys().copied().collect()
    }

    /// Run scan cycles until cancelled. Cgroups are deliberately left
    /// behind on shutdown; the kernel keeps enforcing the limits.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.adopt_restored_state(&shutdown).await;

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("governor stopping; cgroups are retained");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            self.scan_once(&shutdown).await;

            let health = self.health().await;
            if health != HealthStatus::Healthy {
                warn!(status = ?health, "governance health degraded");
            }
        }
    }

    /// Re-arm monitors for processes tracked by a previous run; drop the
    /// entries whose processes are gone.
    async fn adopt_restored_state(&self, shutdown: &CancellationToken) {
        let restored: Vec<TrackedProcess> = {
            let tracked = self.tracked.lock().await;
            tracked.values().cloned().collect()
        };
        for entry in restored {
            if scan::process_exists(&self.config.proc_root, entry.pid) {
                debug!(pid = entry.pid, target = %entry.target, "re-adopted tracked process");
                self.spawn_monitor(entry.pid, entry.target.clone(), shutdown.clone());
            } else {
                self.tracked.lock().await.remove(&entry.pid);
                self.cgroups.remove(&entry.target, entry.pid);
            }
        }
        self.persist().await;
    }

    /// One pass: enumerate, filter, attach new candidates.
    pub async fn scan_once(&self, shutdown: &CancellationToken) {
        let processes = match scan::scan(&self.config.proc_root) {
            Ok(processes) => {
                self.stats.lock().await.health.record_scan_success();
                processes
            }
            Err(e) => {
                warn!(error = %e, "process scan failed");
                self.stats.lock().await.health.record_scan_failure();
                return;
            }
        };

        let parents: HashMap<i32, i32> = processes.iter().map(|p| (p.pid, p.ppid)).collect();

        for process in &processes {
            if !self.config.targets.iter().any(|t| t == &process.comm) {
                continue;
            }
            if process.pid == self.config.self_pid
                || descends_from(&parents, process.pid, self.config.self_pid)
            {
                continue;
            }
            if !self.config.filter.admits(process) {
                continue;
            }
            if self.tracked.lock().await.contains_key(&process.pid) {
                continue;
            }
            self.attach(process, shutdown).await;
        }

        let mut stats = self.stats.lock().await;
        stats.scans += 1;
        drop(stats);
        self.persist().await;
    }

    async fn attach(&self, process: &ProcessInfo, shutdown: &CancellationToken) {
        match self.cgroups.attach(&process.comm, process.pid) {
            Ok(attachment) => {
                let limited = attachment == Attachment::Limited;
                info!(
                    pid = process.pid,
                    target = %process.comm,
                    limited,
                    "process attached for governance"
                );
                self.tracked.lock().await.insert(
                    process.pid,
                    TrackedProcess {
                        pid: process.pid,
                        target: process.comm.clone(),
                        attached_at: Utc::now(),
                        limited,
                    },
                );
                let mut stats = self.stats.lock().await;
                stats.attached_total += 1;
                stats.health.record_attach_success();
                drop(stats);
                self.spawn_monitor(process.pid, process.comm.clone(), shutdown.clone());
            }
            Err(e) => {
                let class = e.class();
                warn!(pid = process.pid, target = %process.comm, error = %e, ?class, "attach failed");
                self.stats.lock().await.health.record_attach_failure(class);
            }
        }
    }

    /// Watch for process exit, then untrack and tear down the group. The
    /// process's exit is entirely its own business; we only clean up
    /// after it.
    fn spawn_monitor(&self, pid: i32, target: String, shutdown: CancellationToken) {
        let governor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.config.monitor_poll);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !scan::process_exists(&governor.config.proc_root, pid) {
                    debug!(pid, target = %target, "governed process exited");
                    governor.tracked.lock().await.remove(&pid);
                    governor.cgroups.remove(&target, pid);
                    governor.stats.lock().await.exited_total += 1;
                    governor.persist().await;
                    return;
                }
            }
        });
    }

    async fn persist(&self) {
        let Some(path) = self.config.state_file.as_deref() else {
            return;
        };
        let snapshot = PersistedState {
            version: state::STATE_VERSION,
            tracked: self.tracked.lock().await.clone(),
            last_scan_at: Some(Utc::now()),
        };
        if let Err(e) = state::save(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "state not persisted");
        }
    }
}

/// Walk the parent chain; bounded in case the snapshot contains a cycle
/// from PID reuse mid-scan.
fn descends_from(parents: &HashMap<i32, i32>, mut pid: i32, ancestor: i32) -> bool {
    for _ in 0..128 {
        match parents.get(&pid) {
            Some(&ppid) => {
                if ppid == ancestor {
                    return true;
                }
                if ppid <= 1 {
                    return false;
                }
                pid = ppid;
            }
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupVersion, Limits};

    fn write_proc(root: &std::path::Path, pid: i32, comm: &str, ppid: i32) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 100 0 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0"),
        )
        .unwrap();
        std::fs::write(dir.join("status"), format!("Name:\t{comm}\nUid:\t1000\t1000\t1000\t1000\n")).unwrap();
        std::fs::write(dir.join("cmdline"), format!("/usr/bin/{comm}\0-i\0x\0").into_bytes()).unwrap();
    }

    fn test_governor(proc_root: &std::path::Path, cgroup_root: &std::path::Path) -> Governor {
        std::fs::write(proc_root.join("uptime"), "1000.0 4000.0\n").unwrap();
        std::fs::write(cgroup_root.join("cgroup.controllers"), "cpu memory\n").unwrap();

        let mut config = GovernorConfig::new(vec!["ffmpeg".to_string()]);
        config.proc_root = proc_root.to_path_buf();
        config.monitor_poll = Duration::from_millis(20);
        config.self_pid = 1;

        let cgroups = CgroupManager::with_version(cgroup_root, CgroupVersion::V2, Limits::default());
        Governor::new(config, cgroups)
    }

    #[tokio::test]
    async fn test_scan_attaches_matching_processes_only() {
        let proc_dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let governor = test_governor(proc_dir.path(), cg_dir.path());

        write_proc(proc_dir.path(), 100, "ffmpeg", 2);
        write_proc(proc_dir.path(), 101, "nginx", 2);

        let shutdown = CancellationToken::new();
        governor.scan_once(&shutdown).await;

        assert_eq!(governor.tracked_pids().await, vec![100]);
        assert!(cg_dir.path().join("ffrtmp/ffmpeg-100/cgroup.procs").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_own_descendants_are_excluded() {
        let proc_dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let governor = test_governor(proc_dir.path(), cg_dir.path());

        // 200 is a child of the daemon (self_pid = 1 in tests).
        write_proc(proc_dir.path(), 200, "ffmpeg", 1);
        // 201 is a grandchild through 200.
        write_proc(proc_dir.path(), 201, "ffmpeg", 200);
        // 300 is unrelated.
        write_proc(proc_dir.path(), 300, "ffmpeg", 2);

        let shutdown = CancellationToken::new();
        governor.scan_once(&shutdown).await;

        assert_eq!(governor.tracked_pids().await, vec![300]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_scan_is_idempotent_for_tracked_pids() {
        let proc_dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let governor = test_governor(proc_dir.path(), cg_dir.path());
        write_proc(proc_dir.path(), 100, "ffmpeg", 2);

        let shutdown = CancellationToken::new();
        governor.scan_once(&shutdown).await;
        governor.scan_once(&shutdown).await;

        assert_eq!(governor.stats.lock().await.attached_total, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_monitor_cleans_up_after_exit() {
        let proc_dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let governor = test_governor(proc_dir.path(), cg_dir.path());
        write_proc(proc_dir.path(), 100, "ffmpeg", 2);

        let shutdown = CancellationToken::new();
        governor.scan_once(&shutdown).await;
        assert_eq!(governor.tracked_pids().await, vec![100]);

        // Simulate process exit.
        std::fs::remove_dir_all(proc_dir.path().join("100")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(governor.tracked_pids().await.is_empty());
        assert!(!cg_dir.path().join("ffrtmp/ffmpeg-100").exists());
        assert_eq!(governor.stats.lock().await.exited_total, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_state_survives_restart_without_reattach() {
        let proc_dir = tempfile::tempdir().unwrap();
        let cg_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let state_path = state_dir.path().join("state.json");

        let mut first = test_governor(proc_dir.path(), cg_dir.path());
        Arc::get_mut(&mut first.config).unwrap().state_file = Some(state_path.clone());
        write_proc(proc_dir.path(), 100, "ffmpeg", 2);

        let shutdown = CancellationToken::new();
        first.scan_once(&shutdown).await;
        shutdown.cancel();

        // A fresh daemon restores the tracked set from the state file.
        let mut config = GovernorConfig::new(vec!["ffmpeg".to_string()]);
        config.proc_root = proc_dir.path().to_path_buf();
        config.state_file = Some(state_path);
        config.self_pid = 1;
        let cgroups =
            CgroupManager::with_version(cg_dir.path(), CgroupVersion::V2, Limits::default());
        let second = Governor::new(config, cgroups);
        assert_eq!(second.tracked_pids().await, vec![100]);

        // Another scan does not attach a second time.
        let shutdown = CancellationToken::new();
        second.scan_once(&shutdown).await;
        assert_eq!(second.stats.lock().await.attached_total, 0);
        shutdown.cancel();
    }

    #[test]
    fn test_descends_from_walks_ancestry() {
        let parents: HashMap<i32, i32> = [(30, 20), (20, 10), (10, 1)].into_iter().collect();
        assert!(descends_from(&parents, 30, 10));
        assert!(descends_from(&parents, 30, 20));
        assert!(!descends_from(&parents, 10, 30));
        assert!(!descends_from(&parents, 30, 99));
    }
}
