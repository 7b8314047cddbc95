//! Process table enumeration.
//!
//! Walks a procfs root and parses `stat`, `status`, `cmdline` and `cwd`
//! per PID. Entries that vanish or deny access mid-walk are skipped;
//! racing against process exits is the normal case here, not an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub uid: u32,
    /// Command basename, as matched against the governed-target list.
    pub comm: String,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub age: Duration,
}

/// Enumerate all readable processes under `proc_root`.
pub fn scan(proc_root: &Path) -> std::io::Result<Vec<ProcessInfo>> {
    let uptime = read_uptime(proc_root);
    let mut processes = Vec::new();

    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if let Some(info) = read_process(proc_root, pid, uptime) {
            processes.push(info);
        }
    }

    Ok(processes)
}

fn read_process(proc_root: &Path, pid: i32, uptime: Option<f64>) -> Option<ProcessInfo> {
    let dir = proc_root.join(pid.to_string());

    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let (comm_from_stat, ppid, starttime_ticks) = parse_stat(&stat)?;

    let uid = fs::read_to_string(dir.join("status"))
        .ok()
        .and_then(|s| parse_uid(&s))
        .unwrap_or(0);

    let cmdline: Vec<String> = fs::read(dir.join("cmdline"))
        .ok()
        .map(|bytes| {
            bytes
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect()
        })
        .unwrap_or_default();

    let comm = cmdline
        .first()
        .map(|argv0| basename(argv0))
        .filter(|c| !c.is_empty())
        .unwrap_or(comm_from_stat);

    let cwd = fs::read_link(dir.join("cwd")).ok();

    let age = match uptime {
        Some(uptime) => {
            let ticks_per_sec = clock_ticks_per_sec();
            let started_secs = starttime_ticks as f64 / ticks_per_sec;
            Duration::from_secs_f64((uptime - started_secs).max(0.0))
        }
        None => Duration::ZERO,
    };

    Some(ProcessInfo {
        pid,
        ppid,
        uid,
        comm,
        cmdline,
        cwd,
        age,
    })
}

/// Extract (comm, ppid, starttime) from a `stat` line. The comm field is
/// parenthesized and may itself contain spaces or parens, so fields are
/// counted from the *last* closing paren.
fn parse_stat(stat: &str) -> Option<(String, i32, u64)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // After comm: state(0), ppid(1), ..., starttime(19).
    let ppid = rest.get(1)?.parse().ok()?;
    let starttime = rest.get(19)?.parse().ok()?;
    Some((comm, ppid, starttime))
}

fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find(|l| l.starts_with("Uid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn read_uptime(proc_root: &Path) -> Option<f64> {
    fs::read_to_string(proc_root.join("uptime"))
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn clock_ticks_per_sec() -> f64 {
    // SAFETY: sysconf with a valid name has no side effects.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Still-alive check used by attachment monitors.
pub fn process_exists(proc_root: &Path, pid: i32) -> bool {
    proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let line = "1234 (gst-launch (x)) S 1 1234 1234 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 555555 1000000 100 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        let (comm, ppid, starttime) = parse_stat(line).unwrap();
        assert_eq!(comm, "gst-launch (x)");
        assert_eq!(ppid, 1);
        assert_eq!(starttime, 555555);
    }

    #[test]
    fn test_parse_uid() {
        let status = "Name:\tffmpeg\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(parse_uid(status), Some(1000));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/usr/bin/ffmpeg"), "ffmpeg");
        assert_eq!(basename("ffmpeg"), "ffmpeg");
    }

    #[test]
    fn test_scan_real_procfs_includes_self() {
        let procs = scan(Path::new("/proc")).unwrap();
        let me = std::process::id() as i32;
        assert!(procs.iter().any(|p| p.pid == me));
    }

    #[test]
    fn test_scan_synthetic_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("uptime"), "1000.00 4000.00\n").unwrap();
        let pid_dir = root.join("4242");
        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("stat"),
            "4242 (ffmpeg) S 1 4242 4242 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 50000 0 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0",
        )
        .unwrap();
        std::fs::write(pid_dir.join("status"), "Name:\tffmpeg\nUid:\t33\t33\t33\t33\n").unwrap();
        std::fs::write(pid_dir.join("cmdline"), b"/usr/bin/ffmpeg\0-i\0in.mp4\0").unwrap();

        let procs = scan(root).unwrap();
        assert_eq!(procs.len(), 1);
        let p = &procs[0];
        assert_eq!(p.pid, 4242);
        assert_eq!(p.comm, "ffmpeg");
        assert_eq!(p.uid, 33);
        assert_eq!(p.cmdline[1], "-i");
        assert!(p.age.as_secs() > 0);
    }
}
