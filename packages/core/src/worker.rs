//! Worker (compute node) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Available,
    Busy,
    Draining,
    Offline,
}

/// Hardware and software inventory advertised at registration.
///
/// `gpu_capabilities` carries runtime-validated encoder tags such as
/// `nvenc_h264` or `qsv`; only encoders that passed the worker's probe
/// appear here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub cpu_threads: u32,
    #[serde(default)]
    pub cpu_model: String,
    pub ram_bytes: u64,
    #[serde(default)]
    pub has_gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub gpu_capabilities: Vec<String>,
    #[serde(default)]
    pub engines: Vec<Engine>,
}

/// Point-in-time resource usage carried on heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub ram_used_bytes: u64,
    pub ram_total_bytes: u64,
    pub running_jobs: u32,
}

/// Registration request from a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    /// Network address, unique across the cluster.
    pub address: String,
    pub capabilities: Capabilities,
}

/// A registered compute agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub status: WorkerStatus,
    pub capabilities: Capabilities,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<ResourceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn from_registration(reg: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: reg.name,
            address: reg.address,
            status: WorkerStatus::Available,
            capabilities: reg.capabilities,
            last_heartbeat: now,
            last_snapshot: None,
            current_job_id: None,
            registered_at: now,
        }
    }

    /// `busy <=> current_job_id` is the worker-side binding invariant.
    pub fn binding_consistent(&self) -> bool {
        (self.status == WorkerStatus::Busy) == self.current_job_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_yields_available_worker() {
        let w = Worker::from_registration(
            WorkerRegistration {
                name: "node-a".into(),
                address: "10.0.0.5:9000".into(),
                capabilities: Capabilities::default(),
            },
            Utc::now(),
        );
        assert_eq!(w.status, WorkerStatus::Available);
        assert!(w.current_job_id.is_none());
        assert!(w.binding_consistent());
    }

    #[test]
    fn test_binding_invariant() {
        let mut w = Worker::from_registration(
            WorkerRegistration {
                name: "node-a".into(),
                address: "10.0.0.5:9000".into(),
                capabilities: Capabilities::default(),
            },
            Utc::now(),
        );
        w.status = WorkerStatus::Busy;
        assert!(!w.binding_consistent());
        w.current_job_id = Some(Uuid::new_v4());
        assert!(w.binding_consistent());
    }
}
