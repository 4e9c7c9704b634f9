//! Admission-controlled proof launch
//!
//! Steps run in a fixed order: validation, rate limiting, the duplicate-job
//! guard, the worker availability check, and only then the launch RPC.
//! Nothing externally visible happens for a request rejected by an earlier
//! step.
//!
//! The duplicate-job guard reads active jobs and launches in two separate
//! calls. Two concurrent launches for one block id can both pass it; the
//! coordinator is the only place that race could be closed.

use crate::audit::{AuditEvent, AuditLogger, Decision};
use crate::coordinator::{LaunchParams, SharedCoordinator};
use crate::error::GatewayError;
use crate::ratelimit::RateLimiter;
use crate::validate::{
    capacity_from_json, validate_compute_capacity, validate_identifier, validate_path, PathKind,
    PathPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Launch request body as sent by clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub block_id: String,
    #[serde(default)]
    pub compute_capacity: Option<serde_json::Value>,
    #[serde(default)]
    pub input_path: String,
    #[serde(default)]
    pub elf_path: Option<String>,
}

impl LaunchRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(body)
            .map_err(|e| GatewayError::invalid(format!("Invalid request body: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LaunchResponse {
    pub success: bool,
    pub job_id: String,
    pub block_id: String,
}

pub struct ProofLauncher {
    coordinator: SharedCoordinator,
    limiter: Arc<RateLimiter>,
    audit: AuditLogger,
    max_compute_capacity: u32,
    path_policy: PathPolicy,
}

impl ProofLauncher {
    pub fn new(
        coordinator: SharedCoordinator,
        limiter: Arc<RateLimiter>,
        audit: AuditLogger,
        max_compute_capacity: u32,
        path_policy: PathPolicy,
    ) -> Self {
        Self {
            coordinator,
            limiter,
            audit,
            max_compute_capacity,
            path_policy,
        }
    }

    fn validate(&self, request: &LaunchRequest) -> Result<LaunchParams, GatewayError> {
        validate_identifier("block_id", &request.block_id)?;

        let capacity = request
            .compute_capacity
            .as_ref()
            .ok_or_else(|| GatewayError::invalid("compute_capacity is required"))?;
        let compute_capacity =
            validate_compute_capacity(capacity_from_json(capacity)?, self.max_compute_capacity)?;

        validate_path(&request.input_path, PathKind::Input, &self.path_policy)?;
        let elf_path = match request.elf_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => {
                validate_path(path, PathKind::Elf, &self.path_policy)?;
                Some(path.to_string())
            }
            None => None,
        };

        Ok(LaunchParams {
            block_id: request.block_id.clone(),
            compute_capacity,
            input_path: request.input_path.clone(),
            elf_path,
        })
    }

    /// Record a request from `client` that failed before admission
    pub fn reject(&self, client: &str, err: &GatewayError) {
        self.audit.record(
            AuditEvent::new("admission.rejected")
                .client(client)
                .decision(Decision::Rejected)
                .reason(err.to_string()),
        );
    }

    /// Parse a raw JSON body and launch it
    pub async fn launch_bytes(&self, client: &str, body: &[u8]) -> Result<LaunchResponse, GatewayError> {
        let request = LaunchRequest::from_slice(body).inspect_err(|e| self.reject(client, e))?;
        self.launch(client, request).await
    }

    /// Validate, admit and forward a launch from `client`
    pub async fn launch(&self, client: &str, request: LaunchRequest) -> Result<LaunchResponse, GatewayError> {
        let params = self.validate(&request).inspect_err(|e| self.reject(client, e))?;

        if let Err(rejection) = self.limiter.admit(client) {
            let err = GatewayError::from(rejection);
            self.audit.record(
                AuditEvent::new("admission.rate_limited")
                    .client(client)
                    .decision(Decision::Rejected)
                    .reason(err.to_string())
                    .field("block_id", params.block_id.as_str()),
            );
            return Err(err);
        }

        let block_id = params.block_id.clone();
        match self.dispatch(params).await {
            Ok(job_id) => {
                info!(client, block_id = %block_id, job_id = %job_id, "Proof launched");
                self.audit.record(
                    AuditEvent::new("launch.succeeded")
                        .client(client)
                        .decision(Decision::Succeeded)
                        .field("block_id", block_id.as_str())
                        .field("job_id", job_id.as_str()),
                );
                Ok(LaunchResponse {
                    success: true,
                    job_id,
                    block_id,
                })
            }
            Err(failure) => {
                let (event, err) = match failure {
                    LaunchFailure::Conflict(e) => ("launch.conflict", e),
                    LaunchFailure::Unavailable(e) => ("launch.unavailable", e),
                    LaunchFailure::Failed(e) => ("launch.failed", e),
                };
                warn!(client, block_id = %block_id, error = %err, "Launch rejected");
                self.audit.record(
                    AuditEvent::new(event)
                        .client(client)
                        .decision(if event == "launch.failed" {
                            Decision::Failed
                        } else {
                            Decision::Rejected
                        })
                        .reason(err.to_string())
                        .field("block_id", block_id.as_str()),
                );
                Err(err)
            }
        }
    }

    async fn dispatch(&self, params: LaunchParams) -> Result<String, LaunchFailure> {
        let active = self
            .coordinator
            .jobs(true)
            .await
            .map_err(LaunchFailure::Failed)?;
        if let Some(job) = active
            .iter()
            .find(|j| j.block_id == params.block_id && j.is_active())
        {
            return Err(LaunchFailure::Conflict(GatewayError::Conflict(format!(
                "Block {} already has an active job ({}). Wait for it to finish before launching again.",
                params.block_id, job.job_id
            ))));
        }

        let status = self
            .coordinator
            .system_status()
            .await
            .map_err(LaunchFailure::Failed)?;
        if status.total_workers == 0 {
            return Err(LaunchFailure::Unavailable(GatewayError::Unavailable(
                "No workers are connected to the coordinator. Start a worker and try again.".to_string(),
            )));
        }
        if status.idle_workers == 0 {
            return Err(LaunchFailure::Unavailable(GatewayError::Unavailable(format!(
                "All {} connected workers are busy. Wait for the running job to finish and try again.",
                status.total_workers
            ))));
        }

        let job_id = self
            .coordinator
            .launch_proof(params)
            .await
            .map_err(LaunchFailure::Failed)?;
        if job_id.is_empty() {
            return Err(LaunchFailure::Failed(GatewayError::Internal(
                "Coordinator accepted the launch but returned no job id".to_string(),
            )));
        }
        Ok(job_id)
    }
}

enum LaunchFailure {
    Conflict(GatewayError),
    Unavailable(GatewayError),
    Failed(GatewayError),
}
