//! Coordinator access behind a trait, so request handling can be exercised
//! against an in-memory fake

use crate::config::{normalize_url, CoordinatorConfig};
use crate::error::GatewayError;
use crate::proto;
use crate::rpc::RpcCaller;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tonic::transport::Endpoint;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CoordinatorInfo {
    pub service_name: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub start_time_unix: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemStatus {
    pub total_workers: u32,
    pub idle_workers: u32,
    pub busy_workers: u32,
    pub compute_capacity: u64,
    pub active_jobs: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobInfo {
    pub job_id: String,
    pub block_id: String,
    pub state: String,
    pub phase: String,
    pub compute_capacity: u32,
    pub assigned_workers: Vec<String>,
    pub start_time_unix: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobInfo {
    /// Whether the job still occupies its block id
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "created" | "running")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub state: String,
    pub compute_capacity: u32,
    pub connected_at_unix: u64,
    pub last_heartbeat_unix: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
}

/// Parameters forwarded to the coordinator for a validated launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParams {
    pub block_id: String,
    pub compute_capacity: u32,
    pub input_path: String,
    pub elf_path: Option<String>,
}

/// Operations the gateway needs from the coordinator
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn status_info(&self) -> Result<CoordinatorInfo, GatewayError>;

    async fn system_status(&self) -> Result<SystemStatus, GatewayError>;

    async fn jobs(&self, active_only: bool) -> Result<Vec<JobInfo>, GatewayError>;

    /// `Ok(None)` when the coordinator does not know the job
    async fn job(&self, job_id: &str) -> Result<Option<JobInfo>, GatewayError>;

    async fn workers(&self) -> Result<Vec<WorkerInfo>, GatewayError>;

    async fn launch_proof(&self, params: LaunchParams) -> Result<String, GatewayError>;

    /// Address shown to operators
    fn endpoint(&self) -> &str;

    /// Calls currently awaiting a response
    fn in_flight(&self) -> usize {
        0
    }
}

pub type SharedCoordinator = Arc<dyn CoordinatorApi>;

/// [`CoordinatorApi`] over gRPC
pub struct GrpcCoordinator {
    url: String,
    client: proto::CoordinatorApiClient,
    caller: RpcCaller,
}

impl GrpcCoordinator {
    pub fn new(config: &CoordinatorConfig, debug: bool) -> anyhow::Result<Self> {
        let url = normalize_url(&config.url);
        let endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| anyhow::anyhow!("Invalid coordinator URL '{}': {}", config.url, e))?
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true);

        Ok(Self {
            url,
            client: proto::CoordinatorApiClient::connect_lazy(endpoint),
            caller: RpcCaller::new(config.rpc_timeout(), debug),
        })
    }

    pub fn caller(&self) -> &RpcCaller {
        &self.caller
    }
}

#[async_trait]
impl CoordinatorApi for GrpcCoordinator {
    async fn status_info(&self) -> Result<CoordinatorInfo, GatewayError> {
        let mut client = self.client.clone();
        let resp = self
            .caller
            .call("StatusInfo", |ctx| async move {
                let mut req = tonic::Request::new(proto::StatusInfoRequest {});
                ctx.attach(&mut req);
                client.status_info(req).await
            })
            .await?
            .into_inner();

        Ok(CoordinatorInfo {
            service_name: resp.service_name,
            version: resp.version,
            uptime_seconds: resp.uptime_seconds,
            start_time_unix: resp.start_time_unix,
        })
    }

    async fn system_status(&self) -> Result<SystemStatus, GatewayError> {
        let mut client = self.client.clone();
        let resp = self
            .caller
            .call("SystemStatus", |ctx| async move {
                let mut req = tonic::Request::new(proto::SystemStatusRequest {});
                ctx.attach(&mut req);
                client.system_status(req).await
            })
            .await?
            .into_inner();

        Ok(SystemStatus {
            total_workers: resp.total_workers,
            idle_workers: resp.idle_workers,
            busy_workers: resp.busy_workers,
            compute_capacity: resp.compute_capacity,
            active_jobs: resp.active_jobs,
        })
    }

    async fn jobs(&self, active_only: bool) -> Result<Vec<JobInfo>, GatewayError> {
        let mut client = self.client.clone();
        let resp = self
            .caller
            .call("JobsList", |ctx| async move {
                let mut req = tonic::Request::new(proto::JobsListRequest { active_only });
                ctx.attach(&mut req);
                client.jobs_list(req).await
            })
            .await?
            .into_inner();

        Ok(resp.jobs.into_iter().map(job_from_proto).collect())
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobInfo>, GatewayError> {
        let mut client = self.client.clone();
        let job_id = job_id.to_string();
        let result = self
            .caller
            .call("JobStatus", |ctx| async move {
                let mut req = tonic::Request::new(proto::JobStatusRequest { job_id });
                ctx.attach(&mut req);
                client.job_status(req).await
            })
            .await;

        match result {
            Ok(resp) => Ok(resp.into_inner().job.map(job_from_proto)),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>, GatewayError> {
        let mut client = self.client.clone();
        let resp = self
            .caller
            .call("WorkersList", |ctx| async move {
                let mut req = tonic::Request::new(proto::WorkersListRequest {
                    available_only: false,
                });
                ctx.attach(&mut req);
                client.workers_list(req).await
            })
            .await?
            .into_inner();

        Ok(resp.workers.into_iter().map(worker_from_proto).collect())
    }

    async fn launch_proof(&self, params: LaunchParams) -> Result<String, GatewayError> {
        let mut client = self.client.clone();
        let resp = self
            .caller
            .call("LaunchProof", |ctx| async move {
                let mut req = tonic::Request::new(proto::LaunchProofRequest {
                    block_id: params.block_id,
                    compute_capacity: params.compute_capacity,
                    input_path: params.input_path,
                    elf_path: params.elf_path,
                });
                ctx.attach(&mut req);
                client.launch_proof(req).await
            })
            .await?
            .into_inner();

        Ok(resp.job_id)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    fn in_flight(&self) -> usize {
        self.caller.in_flight()
    }
}

fn job_state_name(state: proto::JobState) -> &'static str {
    match state {
        proto::JobState::Unspecified => "unknown",
        proto::JobState::Created => "created",
        proto::JobState::Running => "running",
        proto::JobState::Completed => "completed",
        proto::JobState::Failed => "failed",
        proto::JobState::Cancelled => "cancelled",
    }
}

fn worker_state_name(state: proto::WorkerState) -> &'static str {
    match state {
        proto::WorkerState::Unspecified => "unknown",
        proto::WorkerState::Idle => "idle",
        proto::WorkerState::Computing => "computing",
        proto::WorkerState::Disconnected => "disconnected",
    }
}

fn job_from_proto(job: proto::JobSummary) -> JobInfo {
    let state = job_state_name(job.state()).to_string();
    JobInfo {
        job_id: job.job_id,
        block_id: job.block_id,
        state,
        phase: job.phase,
        compute_capacity: job.compute_capacity,
        assigned_workers: job.assigned_workers,
        start_time_unix: job.start_time_unix,
        duration_ms: job.duration_ms,
        error: Some(job.error).filter(|e| !e.is_empty()),
    }
}

fn worker_from_proto(worker: proto::WorkerSummary) -> WorkerInfo {
    let state = worker_state_name(worker.state()).to_string();
    WorkerInfo {
        worker_id: worker.worker_id,
        state,
        compute_capacity: worker.compute_capacity,
        connected_at_unix: worker.connected_at_unix,
        last_heartbeat_unix: worker.last_heartbeat_unix,
        current_job_id: Some(worker.current_job_id).filter(|j| !j.is_empty()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_job_conversion() {
        let job = job_from_proto(proto::JobSummary {
            job_id: "job-1".to_string(),
            block_id: "b1".to_string(),
            state: proto::JobState::Running as i32,
            phase: "aggregation".to_string(),
            compute_capacity: 10,
            assigned_workers: vec!["w1".to_string()],
            start_time_unix: 1_700_000_000,
            duration_ms: 1200,
            error: String::new(),
        });

        assert_eq!(job.state, "running");
        assert!(job.is_active());
        assert!(job.error.is_none());
        assert_eq!(job.assigned_workers, vec!["w1"]);
    }

    #[test]
    fn test_finished_jobs_are_inactive() {
        for state in [proto::JobState::Completed, proto::JobState::Failed, proto::JobState::Cancelled] {
            let job = job_from_proto(proto::JobSummary {
                state: state as i32,
                ..Default::default()
            });
            assert!(!job.is_active(), "{state:?}");
        }
    }

    #[test]
    fn test_worker_conversion() {
        let worker = worker_from_proto(proto::WorkerSummary {
            worker_id: "w1".to_string(),
            state: proto::WorkerState::Idle as i32,
            compute_capacity: 10,
            ..Default::default()
        });
        assert_eq!(worker.state, "idle");
        assert!(worker.current_job_id.is_none());
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = CoordinatorConfig {
            url: "http://bad host:50051".to_string(),
            ..Default::default()
        };
        assert!(GrpcCoordinator::new(&config, false).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_sanitized() {
        let config = CoordinatorConfig {
            url: "127.0.0.1:1".to_string(),
            rpc_timeout_ms: 2_000,
            connect_timeout_ms: 500,
        };
        let coordinator = GrpcCoordinator::new(&config, false).unwrap();
        assert_eq!(coordinator.endpoint(), "http://127.0.0.1:1");

        let err = coordinator.system_status().await.unwrap_err();
        assert!(
            matches!(err.code(), ErrorCode::Unavailable | ErrorCode::Timeout | ErrorCode::Internal),
            "unexpected {err:?}"
        );
        assert!(!err.to_string().contains("127.0.0.1"));
        assert_eq!(coordinator.in_flight(), 0);
    }
}
