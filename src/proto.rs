//! gRPC bindings for the coordinator's `coordinator.v1.CoordinatorApi`
//! service.
//!
//! Kept by hand in the shape `tonic-build` emits so the gateway builds
//! without `protoc`. Field tags must match the coordinator's schema.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::GrpcMethod;
use tonic::transport::{Channel, Endpoint};

pub const SERVICE_NAME: &str = "coordinator.v1.CoordinatorApi";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusInfoResponse {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub uptime_seconds: u64,
    #[prost(uint64, tag = "4")]
    pub start_time_unix: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemStatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemStatusResponse {
    #[prost(uint32, tag = "1")]
    pub total_workers: u32,
    #[prost(uint32, tag = "2")]
    pub idle_workers: u32,
    #[prost(uint32, tag = "3")]
    pub busy_workers: u32,
    #[prost(uint64, tag = "4")]
    pub compute_capacity: u64,
    #[prost(uint32, tag = "5")]
    pub active_jobs: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Unspecified = 0,
    Created = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WorkerState {
    Unspecified = 0,
    Idle = 1,
    Computing = 2,
    Disconnected = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobSummary {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub block_id: ::prost::alloc::string::String,
    #[prost(enumeration = "JobState", tag = "3")]
    pub state: i32,
    #[prost(string, tag = "4")]
    pub phase: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub compute_capacity: u32,
    #[prost(string, repeated, tag = "6")]
    pub assigned_workers: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint64, tag = "7")]
    pub start_time_unix: u64,
    #[prost(uint64, tag = "8")]
    pub duration_ms: u64,
    #[prost(string, tag = "9")]
    pub error: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobsListRequest {
    #[prost(bool, tag = "1")]
    pub active_only: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobsListResponse {
    #[prost(message, repeated, tag = "1")]
    pub jobs: ::prost::alloc::vec::Vec<JobSummary>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobStatusRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub job: ::core::option::Option<JobSummary>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerSummary {
    #[prost(string, tag = "1")]
    pub worker_id: ::prost::alloc::string::String,
    #[prost(enumeration = "WorkerState", tag = "2")]
    pub state: i32,
    #[prost(uint32, tag = "3")]
    pub compute_capacity: u32,
    #[prost(uint64, tag = "4")]
    pub connected_at_unix: u64,
    #[prost(uint64, tag = "5")]
    pub last_heartbeat_unix: u64,
    #[prost(string, tag = "6")]
    pub current_job_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkersListRequest {
    #[prost(bool, tag = "1")]
    pub available_only: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkersListResponse {
    #[prost(message, repeated, tag = "1")]
    pub workers: ::prost::alloc::vec::Vec<WorkerSummary>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LaunchProofRequest {
    #[prost(string, tag = "1")]
    pub block_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub compute_capacity: u32,
    #[prost(string, tag = "3")]
    pub input_path: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "4")]
    pub elf_path: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LaunchProofResponse {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
}

/// Unary client for the coordinator service
#[derive(Debug, Clone)]
pub struct CoordinatorApiClient {
    inner: tonic::client::Grpc<Channel>,
}

impl CoordinatorApiClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Build a client whose channel connects on first use, so the gateway
    /// can start before the coordinator does.
    pub fn connect_lazy(endpoint: Endpoint) -> Self {
        Self::new(endpoint.connect_lazy())
    }

    async fn unary<Req, Resp>(
        &mut self,
        request: tonic::Request<Req>,
        method: &'static str,
        path: &'static str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: ::prost::Message + Send + Sync + 'static,
        Resp: ::prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {}", e)))?;
        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let mut request = request;
        request
            .extensions_mut()
            .insert(GrpcMethod::new(SERVICE_NAME, method));
        self.inner
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
    }

    pub async fn status_info(
        &mut self,
        request: tonic::Request<StatusInfoRequest>,
    ) -> Result<tonic::Response<StatusInfoResponse>, tonic::Status> {
        self.unary(request, "StatusInfo", "/coordinator.v1.CoordinatorApi/StatusInfo")
            .await
    }

    pub async fn system_status(
        &mut self,
        request: tonic::Request<SystemStatusRequest>,
    ) -> Result<tonic::Response<SystemStatusResponse>, tonic::Status> {
        self.unary(request, "SystemStatus", "/coordinator.v1.CoordinatorApi/SystemStatus")
            .await
    }

    pub async fn jobs_list(
        &mut self,
        request: tonic::Request<JobsListRequest>,
    ) -> Result<tonic::Response<JobsListResponse>, tonic::Status> {
        self.unary(request, "JobsList", "/coordinator.v1.CoordinatorApi/JobsList")
            .await
    }

    pub async fn job_status(
        &mut self,
        request: tonic::Request<JobStatusRequest>,
    ) -> Result<tonic::Response<JobStatusResponse>, tonic::Status> {
        self.unary(request, "JobStatus", "/coordinator.v1.CoordinatorApi/JobStatus")
            .await
    }

    pub async fn workers_list(
        &mut self,
        request: tonic::Request<WorkersListRequest>,
    ) -> Result<tonic::Response<WorkersListResponse>, tonic::Status> {
        self.unary(request, "WorkersList", "/coordinator.v1.CoordinatorApi/WorkersList")
            .await
    }

    pub async fn launch_proof(
        &mut self,
        request: tonic::Request<LaunchProofRequest>,
    ) -> Result<tonic::Response<LaunchProofResponse>, tonic::Status> {
        self.unary(request, "LaunchProof", "/coordinator.v1.CoordinatorApi/LaunchProof")
            .await
    }
}
