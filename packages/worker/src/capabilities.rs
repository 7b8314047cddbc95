//! Local hardware inventory and runtime encoder validation.
//!
//! Encoders are not trusted from a build-flag listing: each candidate has
//! to survive a 0.1 second test encode before it is advertised. A GPU
//! that `nvidia-smi` reports but whose encoder probe fails is therefore
//! never offered to the scheduler.

use std::process::Stdio;
use std::time::Duration;

use ffrtmp_core::capability::encoder_tag;
use ffrtmp_core::{Capabilities, Engine, ResourceSnapshot};
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Encoders worth probing, software first.
const ENCODER_CANDIDATES: &[&str] = &[
    "libx264",
    "libx265",
    "h264_nvenc",
    "hevc_nvenc",
    "h264_qsv",
    "hevc_qsv",
    "h264_vaapi",
];

/// Hard ceiling per probe; a hung driver must not stall startup.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// System inventory handle, kept alive for heartbeat snapshots.
pub struct Inventory {
    sys: System,
}

impl Inventory {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys }
    }

    pub fn cpu_threads(&self) -> u32 {
        self.sys.cpus().len() as u32
    }

    pub fn cpu_model(&self) -> String {
        self.sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default()
    }

    pub fn ram_bytes(&self) -> u64 {
        self.sys.total_memory()
    }

    /// Current usage for heartbeats.
    pub fn snapshot(&mut self, running_jobs: u32) -> ResourceSnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        ResourceSnapshot {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            ram_used_bytes: self.sys.used_memory(),
            ram_total_bytes: self.sys.total_memory(),
            running_jobs,
        }
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect everything the worker will advertise at registration.
pub async fn detect(inventory: &Inventory, skip_encoder_probe: bool) -> Capabilities {
    let (has_gpu, gpu_type) = detect_gpu().await;

    let mut engines = Vec::new();
    if binary_responds("ffmpeg", &["-version"]).await {
        engines.push(Engine::Ffmpeg);
    }
    if binary_responds("gst-launch-1.0", &["--version"]).await {
        engines.push(Engine::Gstreamer);
    }

    let mut gpu_capabilities = Vec::new();
    if !skip_encoder_probe && engines.contains(&Engine::Ffmpeg) {
        for candidate in ENCODER_CANDIDATES {
            let Some(tag) = encoder_tag(candidate) else {
                // Software encoders are implied by the engine listing.
                continue;
            };
            if !has_gpu {
                continue;
            }
            if probe_encoder(candidate).await {
                info!(encoder = candidate, tag = %tag, "encoder validated");
                gpu_capabilities.push(tag);
            } else {
                debug!(encoder = candidate, "encoder probe failed, not advertising");
            }
        }
    }

    Capabilities {
        cpu_threads: inventory.cpu_threads(),
        cpu_model: inventory.cpu_model(),
        ram_bytes: inventory.ram_bytes(),
        has_gpu,
        gpu_type,
        gpu_capabilities,
        engines,
    }
}

async fn detect_gpu() -> (bool, Option<String>) {
    let mut cmd = Command::new("nvidia-smi");
    cmd.args(["--query-gpu=name", "--format=csv,noheader"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => {
            let name = String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if name.is_empty() {
                (false, None)
            } else {
                (true, Some(name))
            }
        }
        _ => (false, None),
    }
}

/// A 0.1 second synthetic encode proves the encoder actually works on
/// this machine (driver, firmware and all), not just that ffmpeg knows
/// its name.
async fn probe_encoder(encoder: &str) -> bool {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "lavfi",
        "-i",
        "testsrc2=duration=0.1:size=128x72:rate=30",
        "-c:v",
        encoder,
        "-f",
        "null",
        "-",
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null());

    match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            warn!(encoder, error = %e, "encoder probe could not start");
            false
        }
        Err(_) => {
            warn!(encoder, "encoder probe timed out");
            false
        }
    }
}

async fn binary_responds(binary: &str, args: &[&str]) -> bool {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await,
        Ok(Ok(status)) if status.success()
    )
}
