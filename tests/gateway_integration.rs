//! Integration tests for the gateway HTTP surface

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proofgate::config::Config;
use proofgate::coordinator::{
    CoordinatorApi, CoordinatorInfo, JobInfo, LaunchParams, SharedCoordinator, SystemStatus, WorkerInfo,
};
use proofgate::error::GatewayError;
use proofgate::inspector::{ProcessInspector, Signal};
use proofgate::server::{Gateway, GatewayServer};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// In-memory coordinator with a configurable worker pool
#[derive(Default)]
struct StubCoordinator {
    idle_workers: Mutex<u32>,
    jobs: Mutex<Vec<JobInfo>>,
    calls: AtomicUsize,
}

impl StubCoordinator {
    fn with_idle_workers(count: u32) -> Self {
        let stub = Self::default();
        *stub.idle_workers.lock() = count;
        stub
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinatorApi for StubCoordinator {
    async fn status_info(&self) -> Result<CoordinatorInfo, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CoordinatorInfo {
            service_name: "stub-coordinator".to_string(),
            version: "9.9.9".to_string(),
            uptime_seconds: 5,
            start_time_unix: 1_700_000_000,
        })
    }

    async fn system_status(&self) -> Result<SystemStatus, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let idle = *self.idle_workers.lock();
        let active = self.jobs.lock().iter().filter(|j| j.is_active()).count() as u32;
        Ok(SystemStatus {
            total_workers: idle + active,
            idle_workers: idle,
            busy_workers: active,
            compute_capacity: u64::from(idle + active) * 10,
            active_jobs: active,
        })
    }

    async fn jobs(&self, active_only: bool) -> Result<Vec<JobInfo>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|j| !active_only || j.is_active())
            .cloned()
            .collect())
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobInfo>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.jobs.lock().iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn launch_proof(&self, params: LaunchParams) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock();
        let job_id = format!("stub-job-{}", jobs.len() + 1);
        jobs.push(JobInfo {
            job_id: job_id.clone(),
            block_id: params.block_id,
            state: "running".to_string(),
            phase: "contributions".to_string(),
            compute_capacity: params.compute_capacity,
            assigned_workers: vec!["w1".to_string()],
            start_time_unix: 1_700_000_000,
            duration_ms: 0,
            error: None,
        });
        let mut idle = self.idle_workers.lock();
        *idle = idle.saturating_sub(1);
        Ok(job_id)
    }

    fn endpoint(&self) -> &str {
        "http://stub:50051"
    }
}

/// Reports a fixed set of PIDs for one executable name
struct ExternalProcesses {
    name: String,
    pids: Vec<u32>,
}

#[async_trait]
impl ProcessInspector for ExternalProcesses {
    async fn find_pids(&self, name: &str) -> io::Result<Vec<u32>> {
        Ok(if name == self.name { self.pids.clone() } else { Vec::new() })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    async fn terminate(&self, _pid: u32, _signal: Signal) -> io::Result<bool> {
        Ok(false)
    }

    async fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>> {
        Ok(self.pids.contains(&pid).then(|| vec![self.name.clone()]))
    }
}

struct TestGateway {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_gateway(coordinator: SharedCoordinator, inspector: Arc<dyn ProcessInspector>) -> TestGateway {
    let mut config = Config::default();
    config.rate_limit.max_requests = 100;
    let gateway = Gateway::new(&config, coordinator, inspector);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&gateway.api), shutdown_rx)
        .await
        .expect("bind gateway");
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestGateway { addr, shutdown_tx }
}

fn no_processes() -> Arc<dyn ProcessInspector> {
    Arc::new(ExternalProcesses {
        name: String::new(),
        pids: Vec::new(),
    })
}

/// Send a raw HTTP/1.1 request and return (status, body)
async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.expect("write request");

    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read response");

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON {body:?}: {e}"))
}

const LAUNCH_B1: &str = r#"{"block_id":"b1","compute_capacity":10,"input_path":"/data/in.bin"}"#;

#[tokio::test]
async fn test_launch_with_no_workers() {
    let gateway = start_gateway(Arc::new(StubCoordinator::default()), no_processes()).await;

    let (status, body) = http_request(gateway.addr, "POST", "/api/proof/launch", LAUNCH_B1).await;
    assert_eq!(status, 503);
    let body = json(&body);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("No workers are connected"));
}

#[tokio::test]
async fn test_launch_then_duplicate_conflicts() {
    let coordinator = Arc::new(StubCoordinator::with_idle_workers(2));
    let gateway = start_gateway(coordinator.clone(), no_processes()).await;

    let (status, body) = http_request(gateway.addr, "POST", "/api/proof/launch", LAUNCH_B1).await;
    assert_eq!(status, 200, "{body}");
    let body = json(&body);
    assert_eq!(body["success"], true);
    assert_eq!(body["block_id"], "b1");
    assert!(!body["job_id"].as_str().unwrap().is_empty());

    // A worker is still idle, so only the active job can block this one
    let (status, body) = http_request(gateway.addr, "POST", "/api/proof/launch", LAUNCH_B1).await;
    assert_eq!(status, 409, "{body}");
    assert_eq!(json(&body)["code"], "CONFLICT");
    assert_eq!(coordinator.jobs.lock().len(), 1);

    // A different block goes through
    let other = r#"{"block_id":"b2","compute_capacity":10,"input_path":"/data/in.bin"}"#;
    let (status, _) = http_request(gateway.addr, "POST", "/api/proof/launch", other).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_invalid_job_id_is_rejected_locally() {
    let coordinator = Arc::new(StubCoordinator::default());
    let gateway = start_gateway(coordinator.clone(), no_processes()).await;

    let (status, body) = http_request(gateway.addr, "GET", "/api/job/not-a-real-id!!", "").await;
    assert_eq!(status, 400);
    assert_eq!(json(&body)["code"], "INVALID_ARGUMENT");
    assert_eq!(coordinator.calls(), 0);
}

#[tokio::test]
async fn test_start_coordinator_with_external_instance() {
    let config = Config::default();
    let inspector = Arc::new(ExternalProcesses {
        name: config.processes.coordinator_name.clone(),
        pids: vec![4242],
    });
    let gateway = start_gateway(Arc::new(StubCoordinator::default()), inspector).await;

    let (status, body) = http_request(gateway.addr, "POST", "/api/coordinator/start", "").await;
    assert_eq!(status, 400, "{body}");
    assert!(json(&body)["error"].as_str().unwrap().contains("already running externally"));

    let (status, body) = http_request(gateway.addr, "GET", "/api/coordinator/process-status", "").await;
    assert_eq!(status, 200);
    let body = json(&body);
    assert_eq!(body["running"], true);
    assert_eq!(body["managed"], false);
    assert_eq!(body["external_pids"][0], 4242);
}

#[tokio::test]
async fn test_health_and_version() {
    let gateway = start_gateway(Arc::new(StubCoordinator::default()), no_processes()).await;

    let (status, body) = http_request(gateway.addr, "GET", "/health", "").await;
    assert_eq!(status, 200);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["coordinator"]["version"], "9.9.9");

    let (status, body) = http_request(gateway.addr, "GET", "/version", "").await;
    assert_eq!(status, 200);
    assert_eq!(json(&body)["name"], "proofgate");
}

#[tokio::test]
async fn test_unknown_route() {
    let gateway = start_gateway(Arc::new(StubCoordinator::default()), no_processes()).await;

    let (status, body) = http_request(gateway.addr, "GET", "/api/nope", "").await;
    assert_eq!(status, 404);
    assert_eq!(json(&body)["success"], false);
}
