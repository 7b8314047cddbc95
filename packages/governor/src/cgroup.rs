//! Version-aware cgroup facade.
//!
//! Creates `ffrtmp/<target>-<pid>` groups and writes resource limits plus
//! the PID. On v2 that is one directory in the unified hierarchy; on v1
//! it is mirrored under the `cpu` and `memory` controllers, with memory
//! writes tolerated as best-effort. Permission problems downgrade the
//! attachment to observation instead of failing it; the governed process
//! is never affected by our inability to limit it.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Resource limits applied to every governed group.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub memory_max_bytes: Option<u64>,
    /// v2 `cpu.max` quota in microseconds per period.
    pub cpu_quota_usec: Option<u64>,
    pub cpu_period_usec: Option<u64>,
    pub cpu_weight: Option<u64>,
}

/// How an attachment ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Group created, limits written, PID enrolled.
    Limited,
    /// Permissions prevented some or all of it; we only observe.
    ObserveOnly,
}

/// Whether an error will clear on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Raced with an exit, or the kernel asked us to try again.
    Transient,
    /// Missing controller or denied access; needs an operator.
    Permanent,
}

#[derive(Debug, Error)]
#[error("cgroup operation failed at {path}: {source}")]
pub struct CgroupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl CgroupError {
    pub fn class(&self) -> ErrorClass {
        match self.source.raw_os_error() {
            Some(libc::ESRCH) | Some(libc::EAGAIN) => ErrorClass::Transient,
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::ENOENT) => ErrorClass::Permanent,
            _ => match self.source.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
        }
    }
}

pub struct CgroupManager {
    root: PathBuf,
    version: CgroupVersion,
    limits: Limits,
}

impl CgroupManager {
    /// Autodetect the hierarchy version from the mounted root: the
    /// unified hierarchy always exposes `cgroup.controllers` at its top.
    pub fn detect(root: impl Into<PathBuf>, limits: Limits) -> Self {
        let root = root.into();
        let version = if root.join("cgroup.controllers").is_file() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        };
        debug!(root = %root.display(), ?version, "cgroup hierarchy detected");
        Self { root, version, limits }
    }

    pub fn with_version(root: impl Into<PathBuf>, version: CgroupVersion, limits: Limits) -> Self {
        Self {
            root: root.into(),
            version,
            limits,
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Relative group path for a governed process.
    pub fn group_name(target: &str, pid: i32) -> String {
        format!("ffrtmp/{target}-{pid}")
    }

    /// Create the group, write limits, enroll the PID.
    ///
    /// Permission failures return `Ok(ObserveOnly)`; only errors that say
    /// the kernel rejected an otherwise-permitted operation propagate.
    pub fn attach(&self, target: &str, pid: i32) -> Result<Attachment, CgroupError> {
        let group = Self::group_name(target, pid);
        match self.version {
            CgroupVersion::V2 => self.attach_v2(&group, pid),
            CgroupVersion::V1 => self.attach_v1(&group, pid),
        }
    }

    fn attach_v2(&self, group: &str, pid: i32) -> Result<Attachment, CgroupError> {
        let dir = self.root.join(group);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!(group, "no permission to create cgroup, observing only");
                return Ok(Attachment::ObserveOnly);
            }
            return Err(CgroupError { path: dir, source: e });
        }

        if let Some(bytes) = self.limits.memory_max_bytes {
            self.write_limit(&dir.join("memory.max"), &bytes.to_string())?;
        }
        let cpu_max = match (self.limits.cpu_quota_usec, self.limits.cpu_period_usec) {
            (Some(quota), period) => Some(format!("{} {}", quota, period.unwrap_or(100_000))),
            (None, Some(period)) => Some(format!("max {period}")),
            (None, None) => None,
        };
        if let Some(value) = cpu_max {
            self.write_limit(&dir.join("cpu.max"), &value)?;
        }
        if let Some(weight) = self.limits.cpu_weight {
            self.write_limit(&dir.join("cpu.weight"), &weight.to_string())?;
        }

        match write_file(&dir.join("cgroup.procs"), &pid.to_string()) {
            Ok(()) => Ok(Attachment::Limited),
            Err(e) if e.source.kind() == io::ErrorKind::PermissionDenied => {
                warn!(group, "no permission to enroll pid, observing only");
                Ok(Attachment::ObserveOnly)
            }
            Err(e) => Err(e),
        }
    }

    fn attach_v1(&self, group: &str, pid: i32) -> Result<Attachment, CgroupError> {
        let cpu_dir = self.root.join("cpu").join(group);
        if let Err(e) = std::fs::create_dir_all(&cpu_dir) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!(group, "no permission to create cpu cgroup, observing only");
                return Ok(Attachment::ObserveOnly);
            }
            return Err(CgroupError { path: cpu_dir, source: e });
        }

        if let Some(quota) = self.limits.cpu_quota_usec {
            self.write_limit(&cpu_dir.join("cpu.cfs_quota_us"), &quota.to_string())?;
        }
        if let Some(period) = self.limits.cpu_period_usec {
            self.write_limit(&cpu_dir.join("cpu.cfs_period_us"), &period.to_string())?;
        }
        if let Some(weight) = self.limits.cpu_weight {
            // v1 cpu.shares default is 1024 where v2 cpu.weight default is
            // 100; scale accordingly.
            let shares = weight.saturating_mul(1024) / 100;
            self.write_limit(&cpu_dir.join("cpu.shares"), &shares.to_string())?;
        }
        write_file(&cpu_dir.join("cgroup.procs"), &pid.to_string())?;

        // The memory controller is best-effort on v1: many hosts mount it
        // read-only for unprivileged users.
        let mem_dir = self.root.join("memory").join(group);
        match std::fs::create_dir_all(&mem_dir) {
            Ok(()) => {
                if let Some(bytes) = self.limits.memory_max_bytes {
                    if let Err(e) =
                        write_file(&mem_dir.join("memory.limit_in_bytes"), &bytes.to_string())
                    {
                        warn!(group, error = %e, "memory limit not applied");
                    }
                }
                if let Err(e) = write_file(&mem_dir.join("cgroup.procs"), &pid.to_string()) {
                    warn!(group, error = %e, "pid not enrolled in memory controller");
                }
            }
            Err(e) => {
                warn!(group, error = %e, "memory controller unavailable");
            }
        }

        Ok(Attachment::Limited)
    }

    /// Limit writes share the permission-tolerance of creation.
    fn write_limit(&self, path: &Path, value: &str) -> Result<(), CgroupError> {
        match write_file(path, value) {
            Ok(()) => Ok(()),
            Err(e) if e.source.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "no permission to write limit, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort teardown after the governed process exits. The kernel
    /// refuses to remove a non-empty group, which is exactly the behavior
    /// we want: never disturb live processes.
    pub fn remove(&self, target: &str, pid: i32) {
        let group = Self::group_name(target, pid);
        let dirs = match self.version {
            CgroupVersion::V2 => vec![self.root.join(&group)],
            CgroupVersion::V1 => vec![
                self.root.join("cpu").join(&group),
                self.root.join("memory").join(&group),
            ],
        };
        for dir in dirs {
            if let Err(e) = std::fs::remove_dir(&dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(dir = %dir.display(), error = %e, "cgroup not removed");
                }
            }
        }
    }
}

fn write_file(path: &Path, value: &str) -> Result<(), CgroupError> {
    std::fs::write(path, value).map_err(|e| CgroupError {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            memory_max_bytes: Some(2 << 30),
            cpu_quota_usec: Some(200_000),
            cpu_period_usec: Some(100_000),
            cpu_weight: Some(100),
        }
    }

    #[test]
    fn test_version_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CgroupManager::detect(dir.path(), Limits::default());
        assert_eq!(mgr.version(), CgroupVersion::V1);

        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory\n").unwrap();
        let mgr = CgroupManager::detect(dir.path(), Limits::default());
        assert_eq!(mgr.version(), CgroupVersion::V2);
    }

    #[test]
    fn test_group_name() {
        assert_eq!(CgroupManager::group_name("ffmpeg", 4242), "ffrtmp/ffmpeg-4242");
    }

    #[test]
    fn test_v2_attach_writes_limits_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory\n").unwrap();
        let mgr = CgroupManager::detect(dir.path(), limits());

        let outcome = mgr.attach("ffmpeg", 4242).unwrap();
        assert_eq!(outcome, Attachment::Limited);

        let group = dir.path().join("ffrtmp/ffmpeg-4242");
        assert_eq!(
            std::fs::read_to_string(group.join("memory.max")).unwrap(),
            (2u64 << 30).to_string()
        );
        assert_eq!(
            std::fs::read_to_string(group.join("cpu.max")).unwrap(),
            "200000 100000"
        );
        assert_eq!(std::fs::read_to_string(group.join("cpu.weight")).unwrap(), "100");
        assert_eq!(std::fs::read_to_string(group.join("cgroup.procs")).unwrap(), "4242");
    }

    #[test]
    fn test_v1_attach_mirrors_controllers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cpu")).unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        let mgr = CgroupManager::with_version(dir.path(), CgroupVersion::V1, limits());

        let outcome = mgr.attach("ffmpeg", 7).unwrap();
        assert_eq!(outcome, Attachment::Limited);

        let cpu = dir.path().join("cpu/ffrtmp/ffmpeg-7");
        let mem = dir.path().join("memory/ffrtmp/ffmpeg-7");
        assert_eq!(std::fs::read_to_string(cpu.join("cpu.cfs_quota_us")).unwrap(), "200000");
        assert_eq!(std::fs::read_to_string(cpu.join("cgroup.procs")).unwrap(), "7");
        assert_eq!(
            std::fs::read_to_string(mem.join("memory.limit_in_bytes")).unwrap(),
            (2u64 << 30).to_string()
        );
    }

    #[test]
    fn test_remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu\n").unwrap();
        let mgr = CgroupManager::detect(dir.path(), Limits::default());
        mgr.attach("ffmpeg", 9).unwrap();
        mgr.remove("ffmpeg", 9);
        assert!(!dir.path().join("ffrtmp/ffmpeg-9").exists());
        // Removing again is quiet.
        mgr.remove("ffmpeg", 9);
    }

    #[test]
    fn test_error_classification() {
        let permanent = CgroupError {
            path: PathBuf::from("/x"),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(permanent.class(), ErrorClass::Permanent);

        let transient = CgroupError {
            path: PathBuf::from("/x"),
            source: io::Error::from_raw_os_error(libc::ESRCH),
        };
        assert_eq!(transient.class(), ErrorClass::Transient);
    }
}
