//! HTTP client for the master, with transport-layer retry.
//!
//! Transport retry is distinct from job retry: it only papers over
//! transient network trouble (refused connections, timeouts, 502/503/504)
//! with a bounded exponential backoff. Anything the master actually said
//! (a 4xx, a conflict, a malformed body) surfaces to the caller
//! immediately.

use std::time::Duration;

use ffrtmp_core::protocol::{
    ClaimRequest, CreateJobResponse, HeartbeatRequest, JobHeartbeatRequest, NextJobResponse,
    RegisterRequest, RegisterResponse, ResultReport,
};
use ffrtmp_core::Job;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level trouble or a gateway 5xx; safe to retry.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The master asked us to slow down.
    #[error("rate limited by master")]
    RateLimited,

    /// The master answered and the answer is final.
    #[error("request failed with status {status}: {body}")]
    Permanent { status: u16, body: String },

    /// A 2xx whose body did not parse.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_) | ClientError::RateLimited)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Permanent { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Bounded exponential backoff: 1s, 2s, 4s, … capped at 10s, at most
/// three retries (four attempts total).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    fn next_delay(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

pub struct MasterClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry: RetryConfig,
}

impl MasterClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.request_json(Method::POST, "/nodes/register", Some(body(req)?)).await
    }

    pub async fn heartbeat(
        &self,
        node_id: Uuid,
        req: &HeartbeatRequest,
    ) -> Result<(), ClientError> {
        self.request_empty(Method::POST, &format!("/nodes/{node_id}/heartbeat"), Some(body(req)?))
            .await
    }

    pub async fn next_job(&self, node_id: Uuid) -> Result<Option<Job>, ClientError> {
        let resp: NextJobResponse = self
            .request_json(Method::GET, &format!("/jobs/next?node_id={node_id}"), None)
            .await?;
        Ok(resp.job)
    }

    pub async fn claim_job(&self, job_id: Uuid, node_id: Uuid) -> Result<Job, ClientError> {
        self.request_json(
            Method::POST,
            &format!("/jobs/{job_id}/claim"),
            Some(body(&ClaimRequest { node_id })?),
        )
        .await
    }

    pub async fn job_heartbeat(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        progress: Option<u8>,
    ) -> Result<(), ClientError> {
        self.request_empty(
            Method::POST,
            &format!("/jobs/{job_id}/heartbeat"),
            Some(body(&JobHeartbeatRequest { node_id, progress })?),
        )
        .await
    }

    pub async fn report_result(&self, report: &ResultReport) -> Result<(), ClientError> {
        self.request_empty(Method::POST, "/results", Some(body(report)?)).await
    }

    /// Present mainly for smoke tooling; the master assigns sequence
    /// numbers, so the response carries both identifiers.
    pub async fn submit_job(
        &self,
        req: &serde_json::Value,
    ) -> Result<CreateJobResponse, ClientError> {
        self.request_json(Method::POST, "/jobs", Some(req.clone())).await
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ClientError> {
        let resp = self.send_with_retry(method, path, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        self.send_with_retry(method, path, body).await.map(|_| ())
    }

    async fn send_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;
        let mut delay = self.retry.initial;

        loop {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(b) = &body {
                request = request.json(b);
            }

            let outcome = match request.send().await {
                Ok(resp) => classify_response(resp).await,
                Err(e) => Err(classify_transport(e)),
            };

            match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    // Rate limiting gets jitter so a fleet of workers does
                    // not reconverge on the same instant.
                    let jitter = if matches!(e, ClientError::RateLimited) {
                        Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 2))
                    } else {
                        Duration::ZERO
                    };
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = (delay + jitter).as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay + jitter).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn classify_response(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(ClientError::RateLimited),
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Err(ClientError::Transient(format!("http {status}"))),
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::Permanent {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ClientError {
    if e.is_decode() {
        ClientError::Malformed(e.to_string())
    } else {
        // Refused, reset, timed out: the network's problem, not ours.
        ClientError::Transient(e.to_string())
    }
}

fn body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ClientError> {
    serde_json::to_value(value).map_err(|e| ClientError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ClientError::Transient("refused".into()).is_retryable());
        assert!(ClientError::RateLimited.is_retryable());
        assert!(!ClientError::Permanent { status: 409, body: String::new() }.is_retryable());
        assert!(!ClientError::Malformed("bad json".into()).is_retryable());
    }

    #[test]
    fn test_backoff_progression_caps() {
        let retry = RetryConfig::default();
        let mut delay = retry.initial;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(delay);
            delay = retry.next_delay(delay);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient_and_bounded() {
        // Nothing listens on this port; every attempt should fail fast and
        // the client should give up after its retry budget.
        let client = MasterClient::new("http://127.0.0.1:59999", None)
            .unwrap()
            .with_retry(RetryConfig {
                initial: Duration::from_millis(5),
                multiplier: 2,
                cap: Duration::from_millis(10),
                max_retries: 2,
            });
        let err = client.next_job(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_retryable(), "refused connection should classify transient: {err}");
    }
}
