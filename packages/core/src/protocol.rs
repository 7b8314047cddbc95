//! Wire DTOs shared by the master's HTTP API and the worker client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Engine, FailureReason, Job, JobPriority, QueueClass};
use crate::worker::{Capabilities, ResourceSnapshot, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub address: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub snapshot: ResourceSnapshot,
    /// Set on the final heartbeat of a graceful shutdown (`draining`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub scenario: String,
    #[serde(default)]
    pub queue: QueueClass,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub params: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
    pub seq: i64,
}

/// `GET /jobs/next` body. `job: null` means nothing eligible right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextJobResponse {
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHeartbeatRequest {
    pub node_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

/// Terminal status a worker may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub job_id: Uuid,
    pub node_id: Uuid,
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub metrics: std::collections::HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency_score: Option<f64>,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// JSON error envelope returned by the master on failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_job_null_round_trip() {
        let body = serde_json::to_string(&NextJobResponse { job: None }).unwrap();
        assert_eq!(body, r#"{"job":null}"#);
        let parsed: NextJobResponse = serde_json::from_str(&body).unwrap();
        assert!(parsed.job.is_none());
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateJobRequest =
            serde_json::from_str(r#"{"scenario":"vod-1080p"}"#).unwrap();
        assert_eq!(req.queue, QueueClass::Default);
        assert_eq!(req.priority, JobPriority::Medium);
        assert_eq!(req.engine, Engine::Auto);
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_failure_reason_wire_format() {
        let report = ResultReport {
            job_id: Uuid::nil(),
            node_id: Uuid::nil(),
            status: ReportedStatus::Failed,
            failure_reason: Some(FailureReason::CapabilityMismatch),
            metrics: Default::default(),
            quality_score: None,
            efficiency_score: None,
            logs: String::new(),
            error: None,
        };
        let body = serde_json::to_string(&report).unwrap();
        assert!(body.contains(r#""failure_reason":"capability_mismatch""#));
        assert!(body.contains(r#""status":"failed""#));
    }
}
