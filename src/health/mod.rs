/// Health probing against the status sidecar each cluster member runs
use crate::error::{PasarelaError, PasarelaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status document served by a backend's sidecar
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub wsrep_local_state: u64,
    #[serde(default)]
    pub wsrep_local_state_comment: String,
    pub wsrep_local_index: u64,
    pub healthy: bool,
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// A probe result: the health verdict plus the ordinal index when the sidecar reported one
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub index: Option<u64>,
}

impl ProbeOutcome {
    /// Interpret a fetch result. Any failure is unhealthy and leaves the index unknown.
    pub fn from_fetch(result: PasarelaResult<StatusResponse>) -> Self {
        match result {
            Ok(response) => {
                let status = if response.healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy {
                        reason: format!(
                            "backend reported unhealthy ({})",
                            response.wsrep_local_state_comment
                        ),
                    }
                };
                Self {
                    status,
                    index: Some(response.wsrep_local_index),
                }
            }
            Err(PasarelaError::Timeout { .. }) => Self {
                status: HealthStatus::Timeout,
                index: None,
            },
            Err(e) => Self {
                status: HealthStatus::Unhealthy {
                    reason: e.to_string(),
                },
                index: None,
            },
        }
    }
}

/// Capability to retrieve a status document from a health check URL
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> PasarelaResult<StatusResponse>;
}

/// HTTP fetcher bounded by the configured health check timeout
#[derive(Debug, Clone)]
pub struct HttpStatusFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpStatusFetcher {
    pub fn new(timeout: Duration) -> PasarelaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PasarelaError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl StatusFetcher for HttpStatusFetcher {
    async fn fetch(&self, url: &str) -> PasarelaResult<StatusResponse> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PasarelaError::timeout(format!("GET {}", url))
            } else {
                PasarelaError::health_check(format!("GET {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PasarelaError::health_check(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        response.json::<StatusResponse>().await.map_err(|e| {
            PasarelaError::health_check(format!("invalid status document from {}: {}", url, e))
        })
    }
}
