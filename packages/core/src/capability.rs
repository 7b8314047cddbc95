//! Capability extraction and matching.
//!
//! A job's parameters imply hardware requirements; workers advertise what
//! they have. The scheduler asks two questions: can *any* registered
//! worker ever run this job (rejection check), and which of the currently
//! available workers can run it now (placement).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{Engine, Job};
use crate::worker::Worker;

/// Codec name fragments that imply hardware encoding.
const GPU_VENDORS: [&str; 4] = ["nvenc", "qsv", "vaapi", "videotoolbox"];

/// Requirements derived from a job's parameter map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequirements {
    pub needs_gpu: bool,
    /// Normalized encoder tag the worker must advertise, e.g. `nvenc_h264`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_tag: Option<String>,
    pub min_cpu_threads: u32,
    pub min_ram_bytes: u64,
    pub engine: Engine,
}

impl CapabilityRequirements {
    pub fn from_job(job: &Job) -> Self {
        Self::from_params(&job.params, job.engine)
    }

    /// Extract requirements from a parameter map.
    ///
    /// GPU need is inferred from a hardware codec name (`*_nvenc`, `*_qsv`,
    /// `*_vaapi`, `*_videotoolbox`) or an explicit `hwaccel` parameter.
    /// `min_cpu_threads` and `min_ram_mb` are honored when present as
    /// numbers or numeric strings.
    pub fn from_params(params: &HashMap<String, serde_json::Value>, engine: Engine) -> Self {
        let codec = params.get("codec").and_then(|v| v.as_str()).unwrap_or("");
        let hwaccel = params
            .get("hwaccel")
            .map(|v| !matches!(v, serde_json::Value::Null))
            .unwrap_or(false);

        let encoder_tag = encoder_tag(codec);
        let needs_gpu = encoder_tag.is_some() || hwaccel;

        Self {
            needs_gpu,
            encoder_tag,
            min_cpu_threads: param_u64(params, "min_cpu_threads") as u32,
            min_ram_bytes: param_u64(params, "min_ram_mb") * 1024 * 1024,
            engine,
        }
    }

    /// Can this particular worker run the job, ignoring its current load?
    pub fn satisfied_by(&self, worker: &Worker) -> bool {
        let caps = &worker.capabilities;

        if self.needs_gpu && !caps.has_gpu {
            return false;
        }
        if let Some(tag) = &self.encoder_tag {
            let vendor = tag.split('_').next().unwrap_or(tag);
            let advertised = caps
                .gpu_capabilities
                .iter()
                .any(|t| t == tag || t == vendor);
            if !advertised {
                return false;
            }
        }
        if caps.cpu_threads < self.min_cpu_threads {
            return false;
        }
        if caps.ram_bytes < self.min_ram_bytes {
            return false;
        }
        if self.engine != Engine::Auto && !caps.engines.is_empty() {
            if !caps.engines.contains(&self.engine) {
                return false;
            }
        }
        true
    }

    /// Rejection check: is there any worker in the cluster, regardless of
    /// its current status, that could satisfy these requirements?
    ///
    /// An empty cluster yields `true`: with nothing to measure against, a
    /// mismatch verdict would be premature and the job stays queued.
    pub fn cluster_can_satisfy(&self, workers: &[Worker]) -> bool {
        if workers.is_empty() {
            return true;
        }
        workers.iter().any(|w| self.satisfied_by(w))
    }
}

/// Normalize a hardware codec name into the tag workers advertise:
/// `h264_nvenc` -> `nvenc_h264`, `hevc_qsv` -> `qsv_hevc`, plain `qsv`
/// stays `qsv`. Software codecs yield `None`. Workers use the same
/// normalization when advertising validated encoders, so both sides of
/// the match speak identical tags.
pub fn encoder_tag(codec: &str) -> Option<String> {
    if codec.is_empty() {
        return None;
    }
    let parts: Vec<&str> = codec.split('_').collect();
    let vendor_idx = parts.iter().position(|p| GPU_VENDORS.contains(p))?;
    let vendor = parts[vendor_idx];
    let rest: Vec<&str> = parts
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != vendor_idx)
        .map(|(_, p)| *p)
        .collect();
    if rest.is_empty() {
        Some(vendor.to_string())
    } else {
        Some(format!("{}_{}", vendor, rest.join("_")))
    }
}

fn param_u64(params: &HashMap<String, serde_json::Value>, key: &str) -> u64 {
    match params.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
