use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream coordinator connection
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Request validation bounds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Admission control for job launches
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Coordinator and worker process supervision
    #[serde(default)]
    pub processes: ProcessConfig,

    /// Audit event emission
    #[serde(default)]
    pub audit: AuditConfig,

    /// Verbose logging, including raw upstream errors (never sent to clients)
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Origins allowed to call the API from a browser. `*` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Use the first X-Forwarded-For entry as the client identity
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            cors_origins: default_cors_origins(),
            trust_proxy: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    /// gRPC endpoint of the coordinator
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    /// Deadline applied to every RPC call, in milliseconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Connection establishment timeout, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            rpc_timeout_ms: default_rpc_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Upper bound for `compute_capacity` on launch and worker start
    #[serde(default = "default_max_compute_capacity")]
    pub max_compute_capacity: u32,

    /// When non-empty, input paths must resolve under one of these roots
    #[serde(default)]
    pub allowed_input_roots: Vec<PathBuf>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_compute_capacity: default_max_compute_capacity(),
            allowed_input_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Length of the admission window in milliseconds
    #[serde(default = "default_rate_window")]
    pub window_ms: u64,

    /// Requests admitted per client per window
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u32,

    /// How often expired records are swept, in milliseconds
    #[serde(default = "default_rate_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window(),
            max_requests: default_rate_max_requests(),
            sweep_interval_ms: default_rate_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Explicit coordinator binary, checked before any search
    pub coordinator_bin: Option<PathBuf>,

    /// Explicit worker binary, checked before any search
    pub worker_bin: Option<PathBuf>,

    /// Repository root holding `target/{release,debug}` build outputs
    pub repo_root: Option<PathBuf>,

    /// Executable name of the coordinator (also used for process matching)
    #[serde(default = "default_coordinator_name")]
    pub coordinator_name: String,

    /// Executable name of the worker (also used for process matching)
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Extra arguments appended to the coordinator command line
    #[serde(default)]
    pub coordinator_args: Vec<String>,

    /// Extra arguments appended to every worker command line
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Time to wait after spawning before checking the child is still alive
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// Time between the graceful and forceful termination signals
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,

    /// Stop managed processes when the gateway shuts down
    #[serde(default = "default_true")]
    pub stop_on_exit: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            coordinator_bin: None,
            worker_bin: None,
            repo_root: None,
            coordinator_name: default_coordinator_name(),
            worker_name: default_worker_name(),
            coordinator_args: Vec::new(),
            worker_args: Vec::new(),
            startup_grace_ms: default_startup_grace(),
            stop_grace_ms: default_stop_grace(),
            stop_on_exit: true,
        }
    }
}

impl ProcessConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_max_compute_capacity() -> u32 {
    10_000
}

fn default_rate_window() -> u64 {
    60_000
}

fn default_rate_max_requests() -> u32 {
    10
}

fn default_rate_sweep_interval() -> u64 {
    60_000
}

fn default_coordinator_name() -> String {
    "proof-coordinator".to_string()
}

fn default_worker_name() -> String {
    "proof-worker".to_string()
}

fn default_startup_grace() -> u64 {
    1_500
}

fn default_stop_grace() -> u64 {
    3_000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment-style variables.
    ///
    /// `lookup` is injected so tests don't have to mutate the process
    /// environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(k))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get(&["PORT", "GATEWAY_PORT"]) {
            self.server.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get(&["BIND_ADDRESS"]) {
            self.server.bind = v;
        }
        if let Some(v) = get(&["CORS_ORIGINS"]) {
            self.server.cors_origins = split_list(&v);
        }
        if let Some(v) = get(&["TRUST_PROXY"]) {
            self.server.trust_proxy = parse_flag(&v);
        }
        if let Some(v) = get(&["COORDINATOR_URL"]) {
            self.coordinator.url = v;
        }
        if let Some(v) = get(&["RPC_TIMEOUT_MS"]) {
            self.coordinator.rpc_timeout_ms = parse_env("RPC_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get(&["RPC_CONNECT_TIMEOUT_MS"]) {
            self.coordinator.connect_timeout_ms = parse_env("RPC_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get(&["DEBUG"]) {
            self.debug = parse_flag(&v);
        }
        if let Some(v) = get(&["MAX_COMPUTE_CAPACITY"]) {
            self.limits.max_compute_capacity = parse_env("MAX_COMPUTE_CAPACITY", &v)?;
        }
        if let Some(v) = get(&["ALLOWED_INPUT_ROOTS"]) {
            self.limits.allowed_input_roots =
                split_list(&v).into_iter().map(PathBuf::from).collect();
        }
        if let Some(v) = get(&["RATE_LIMIT_WINDOW_MS"]) {
            self.rate_limit.window_ms = parse_env("RATE_LIMIT_WINDOW_MS", &v)?;
        }
        if let Some(v) = get(&["RATE_LIMIT_MAX_REQUESTS"]) {
            self.rate_limit.max_requests = parse_env("RATE_LIMIT_MAX_REQUESTS", &v)?;
        }
        if let Some(v) = get(&["RATE_LIMIT_SWEEP_MS"]) {
            self.rate_limit.sweep_interval_ms = parse_env("RATE_LIMIT_SWEEP_MS", &v)?;
        }
        if let Some(v) = get(&["COORDINATOR_BIN"]) {
            self.processes.coordinator_bin = Some(PathBuf::from(v));
        }
        if let Some(v) = get(&["WORKER_BIN"]) {
            self.processes.worker_bin = Some(PathBuf::from(v));
        }
        if let Some(v) = get(&["REPO_ROOT"]) {
            self.processes.repo_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get(&["COORDINATOR_ARGS"]) {
            self.processes.coordinator_args = shell_words::split(&v)
                .map_err(|e| anyhow::anyhow!("Invalid COORDINATOR_ARGS: {}", e))?;
        }
        if let Some(v) = get(&["WORKER_ARGS"]) {
            self.processes.worker_args = shell_words::split(&v)
                .map_err(|e| anyhow::anyhow!("Invalid WORKER_ARGS: {}", e))?;
        }
        if let Some(v) = get(&["STOP_MANAGED_ON_EXIT"]) {
            self.processes.stop_on_exit = parse_flag(&v);
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.coordinator.rpc_timeout_ms == 0 {
            errors.push("coordinator.rpc_timeout_ms must be greater than 0".to_string());
        }
        if self.coordinator.url.trim().is_empty() {
            errors.push("coordinator.url must not be empty".to_string());
        } else if tonic::transport::Endpoint::from_shared(normalize_url(&self.coordinator.url))
            .is_err()
        {
            errors.push(format!("coordinator.url is not a valid URI: {}", self.coordinator.url));
        }
        if self.limits.max_compute_capacity == 0 {
            errors.push("limits.max_compute_capacity must be greater than 0".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            errors.push("rate_limit.window_ms must be greater than 0".to_string());
        }
        if self.rate_limit.max_requests == 0 {
            errors.push("rate_limit.max_requests must be greater than 0".to_string());
        }
        if self.rate_limit.sweep_interval_ms == 0 {
            errors.push("rate_limit.sweep_interval_ms must be greater than 0".to_string());
        }
        if self.processes.coordinator_name.is_empty() || self.processes.worker_name.is_empty() {
            errors.push("process binary names must not be empty".to_string());
        }
        for (field, value) in [
            ("coordinator.rpc_timeout_ms", self.coordinator.rpc_timeout_ms),
            ("coordinator.connect_timeout_ms", self.coordinator.connect_timeout_ms),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("rate_limit.sweep_interval_ms", self.rate_limit.sweep_interval_ms),
            ("processes.startup_grace_ms", self.processes.startup_grace_ms),
            ("processes.stop_grace_ms", self.processes.stop_grace_ms),
        ] {
            if value > MAX_DURATION_MS {
                errors.push(format!("{} must be at most {} (24h)", field, MAX_DURATION_MS));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Upper bound for every millisecond setting; deadlines are computed as `Instant + Duration`
const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Prefix a scheme when the address is a bare `host:port`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_env<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, value, e))
}
