//! HTTP API for operators and the dashboard
//!
//! Read endpoints proxy coordinator queries, `/api/proof/launch` goes through
//! admission control, and the process endpoints drive the supervisor.

use crate::config::ServerConfig;
use crate::coordinator::SharedCoordinator;
use crate::error::GatewayError;
use crate::launch::ProofLauncher;
use crate::supervisor::{ProcessSupervisor, WorkerLaunch};
use crate::validate::{capacity_from_json, validate_identifier, validate_job_id};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok(value: &Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, value.to_string())
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

/// Serialize `value` and mark it successful. Objects get a top-level
/// `success: true`; anything else is wrapped under `data`.
fn success<T: Serialize>(value: &T) -> Result<Response<Full<Bytes>>, GatewayError> {
    let mut body = serde_json::to_value(value)
        .map_err(|e| GatewayError::Internal(format!("Failed to encode response: {}", e)))?;
    match body.as_object_mut() {
        Some(map) => {
            map.insert("success".to_string(), Value::Bool(true));
        }
        None => body = json!({ "success": true, "data": body }),
    }
    Ok(json_ok(&body))
}

/// Worker start request body
#[derive(Debug, Deserialize)]
struct WorkerStartBody {
    #[serde(default)]
    elf_path: String,
    #[serde(default)]
    input_path: String,
    #[serde(default)]
    compute_capacity: Option<Value>,
    #[serde(default)]
    worker_id: Option<String>,
}

pub struct GatewayApi {
    coordinator: SharedCoordinator,
    launcher: ProofLauncher,
    supervisor: Arc<ProcessSupervisor>,
    cors_origins: Vec<String>,
    trust_proxy: bool,
}

impl GatewayApi {
    pub fn new(
        coordinator: SharedCoordinator,
        launcher: ProofLauncher,
        supervisor: Arc<ProcessSupervisor>,
        server: &ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            launcher,
            supervisor,
            cors_origins: server.cors_origins.clone(),
            trust_proxy: server.trust_proxy,
        })
    }

    /// Handle one request from `peer`. Never fails: every error becomes a
    /// JSON response.
    pub async fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = request_id(req.headers());
        let origin = self.allowed_origin(req.headers());
        let client = client_identity(req.headers(), peer, self.trust_proxy);

        debug!(%method, %path, %request_id, %client, "API request");

        let mut response = if method == Method::OPTIONS {
            empty_response(StatusCode::NO_CONTENT)
        } else {
            match self.route(req, &client).await {
                Ok(response) => response,
                Err(e) => {
                    if e.code().status_code().is_server_error() {
                        warn!(%method, %path, %request_id, error = %e, "Request failed");
                    }
                    e.into_response()
                }
            }
        };

        decorate(response.headers_mut(), &request_id, origin.as_deref());
        info!(
            %method,
            %path,
            %request_id,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(response)
    }

    async fn route<B>(&self, req: Request<B>, client: &str) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        match (method, path.as_str()) {
            (Method::GET, "/health") => Ok(self.health().await),

            (Method::GET, "/version") => Ok(json_ok(&json!({
                "name": PKG_NAME,
                "version": VERSION,
            }))),

            (Method::GET, "/api/coordinator/info") => Ok(self.coordinator_info().await),

            (Method::GET, "/api/system/status") => {
                let status = self.coordinator.system_status().await?;
                success(&status)
            }

            (Method::GET, "/api/workers") => {
                let workers = self.coordinator.workers().await?;
                success(&json!({ "count": workers.len(), "workers": workers }))
            }

            (Method::GET, "/api/jobs") => {
                let active_only = query_flag(&query, "active_only");
                let jobs = self.coordinator.jobs(active_only).await?;
                success(&json!({ "count": jobs.len(), "jobs": jobs }))
            }

            (Method::POST, p) if p.starts_with("/api/job/") && p.ends_with("/cancel") => {
                let raw = p
                    .strip_prefix("/api/job/")
                    .and_then(|p| p.strip_suffix("/cancel"))
                    .unwrap_or("");
                let job_id = path_param(raw)?;
                validate_job_id(&job_id)?;
                Err(GatewayError::NotImplemented(
                    "Job cancellation is not supported by the coordinator yet".to_string(),
                ))
            }

            (Method::GET, p) if p.starts_with("/api/job/") => {
                let job_id = path_param(p.strip_prefix("/api/job/").unwrap_or(""))?;
                validate_job_id(&job_id)?;
                match self.coordinator.job(&job_id).await? {
                    Some(job) => success(&json!({ "job": job })),
                    None => Err(GatewayError::NotFound(format!("Job {} not found", job_id))),
                }
            }

            (Method::POST, "/api/proof/launch") => {
                let body = read_body(req.into_body())
                    .await
                    .inspect_err(|e| self.launcher.reject(client, e))?;
                let launched = self.launcher.launch_bytes(client, &body).await?;
                success(&launched)
            }

            (Method::POST, "/api/coordinator/start") => {
                let started = self.supervisor.start_coordinator().await?;
                success(&json!({ "running": true, "managed": true, "process": started }))
            }

            (Method::POST, "/api/coordinator/stop") => {
                let outcome = self.supervisor.stop_coordinator().await?;
                success(&json!({ "running": false, "result": outcome }))
            }

            (Method::GET, "/api/coordinator/process-status") => {
                let status = self.supervisor.coordinator_status().await?;
                success(&status)
            }

            (Method::POST, "/api/worker/start") => {
                let body = read_body(req.into_body()).await?;
                let body: WorkerStartBody = serde_json::from_slice(&body)
                    .map_err(|e| GatewayError::invalid(format!("Invalid request body: {}", e)))?;
                let compute_capacity = body.compute_capacity.as_ref().map(capacity_from_json).transpose()?;
                let started = self
                    .supervisor
                    .start_worker(WorkerLaunch {
                        elf_path: body.elf_path,
                        input_path: body.input_path,
                        compute_capacity,
                        worker_id: body.worker_id,
                    })
                    .await?;
                success(&json!({ "running": true, "managed": true, "process": started }))
            }

            (Method::POST, p) if p.starts_with("/api/worker/stop/") => {
                let worker_id = path_param(p.strip_prefix("/api/worker/stop/").unwrap_or(""))?;
                let outcome = self.supervisor.stop_worker(&worker_id).await?;
                success(&json!({ "worker_id": worker_id, "running": false, "result": outcome }))
            }

            (Method::GET, "/api/worker/process-status") => match query_param(&query, "worker_id") {
                Some(worker_id) => {
                    validate_identifier("worker id", &worker_id)?;
                    let status = self.supervisor.worker_status_by_id(&worker_id).await?;
                    success(&status)
                }
                None => {
                    let workers = self.supervisor.worker_status().await?;
                    success(&json!({ "count": workers.len(), "workers": workers }))
                }
            },

            _ => Err(GatewayError::NotFound(format!("No route for {}", path))),
        }
    }

    /// 200 when the coordinator answers, 503 otherwise
    async fn health(&self) -> Response<Full<Bytes>> {
        match self.coordinator.status_info().await {
            Ok(info) => json_ok(&json!({
                "success": true,
                "status": "ok",
                "gateway": { "name": PKG_NAME, "version": VERSION },
                "coordinator": {
                    "status": "connected",
                    "service_name": info.service_name,
                    "version": info.version,
                    "uptime_seconds": info.uptime_seconds,
                },
            })),
            Err(e) => {
                let body = json!({
                    "success": false,
                    "status": "unhealthy",
                    "code": e.code(),
                    "error": e.to_string(),
                    "gateway": { "name": PKG_NAME, "version": VERSION },
                    "coordinator": { "status": "disconnected" },
                });
                json_response(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
            }
        }
    }

    /// Always 200; a failing coordinator is reported as disconnected
    async fn coordinator_info(&self) -> Response<Full<Bytes>> {
        let endpoint = self.coordinator.endpoint().to_string();
        let info = match self.coordinator.status_info().await {
            Ok(info) => info,
            Err(e) => {
                return json_ok(&json!({
                    "success": false,
                    "status": "disconnected",
                    "endpoint": endpoint,
                    "error": e.to_string(),
                    "in_flight": self.coordinator.in_flight(),
                }));
            }
        };

        // Status is optional detail; info alone proves connectivity
        let system = self.coordinator.system_status().await.ok();
        json_ok(&json!({
            "success": true,
            "status": "connected",
            "endpoint": endpoint,
            "info": info,
            "system": system,
            "in_flight": self.coordinator.in_flight(),
        }))
    }

    fn allowed_origin(&self, headers: &HeaderMap) -> Option<String> {
        if self.cors_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        let origin = headers.get("origin")?.to_str().ok()?;
        self.cors_origins
            .iter()
            .any(|o| o == origin)
            .then(|| origin.to_string())
    }
}

/// Add request id and CORS headers
fn decorate(headers: &mut HeaderMap, request_id: &str, origin: Option<&str>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    let Some(origin) = origin.and_then(|o| HeaderValue::from_str(o).ok()) else {
        return;
    };
    headers.insert("access-control-allow-origin", origin);
    headers.insert("vary", HeaderValue::from_static("Origin"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, X-Request-Id"),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static("X-Request-Id, X-Gateway-Error, Retry-After"),
    );
}

/// Incoming request id when it looks sane, otherwise a fresh one
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| validate_identifier("request id", id).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Rate limiting key: the peer IP, or the first forwarded address when the
/// gateway sits behind a trusted proxy
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    peer.ip().to_string()
}

fn path_param(raw: &str) -> Result<String, GatewayError> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|_| GatewayError::invalid("Path parameter is not valid UTF-8"))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key {
            return None;
        }
        urlencoding::decode(&v.replace('+', " ")).ok().map(|v| v.into_owned())
    })
}

fn query_flag(query: &str, key: &str) -> bool {
    query_param(query, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "" | "1" | "true" | "yes"))
        .unwrap_or(false)
}

async fn read_body<B>(body: B) -> Result<Bytes, GatewayError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(GatewayError::invalid(
            format!("Request body exceeds {} bytes", MAX_BODY_BYTES),
        )),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            Err(GatewayError::invalid("Could not read request body"))
        }
    }
}
