//! Input validation run before admission control or any RPC work
//!
//! Every check here is a pure function over its arguments: no I/O, no
//! filesystem access, and the same input always yields the same verdict.

use crate::error::GatewayError;
use std::path::{Component, Path, PathBuf};

/// Longest accepted job or block identifier
pub const MAX_ID_LEN: usize = 128;

/// Longest accepted filesystem path
pub const MAX_PATH_LEN: usize = 512;

/// Identifiers that usually mean a client serialized a missing value
const RESERVED_IDS: [&str; 4] = ["undefined", "null", "true", "false"];

/// What a path argument is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Proof input data; subject to the allow-listed roots
    Input,
    /// Program ELF
    Elf,
}

impl PathKind {
    fn label(&self) -> &'static str {
        match self {
            PathKind::Input => "input_path",
            PathKind::Elf => "elf_path",
        }
    }
}

/// Path validation settings
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    /// When non-empty, input paths must resolve under one of these roots
    pub allowed_input_roots: Vec<PathBuf>,
    /// Base for resolving relative paths; relative paths are resolved
    /// against `/` when unset
    pub base_dir: Option<PathBuf>,
}

/// Validate a job or block identifier.
pub fn validate_job_id(id: &str) -> Result<(), GatewayError> {
    validate_identifier("job id", id)
}

/// Validate an identifier against `^[A-Za-z0-9_-]{1,128}$`, rejecting the
/// reserved literals.
pub fn validate_identifier(label: &str, id: &str) -> Result<(), GatewayError> {
    if id.is_empty() {
        return Err(GatewayError::invalid(format!("{} must not be empty", label)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(GatewayError::invalid(format!(
            "{} must be at most {} characters",
            label, MAX_ID_LEN
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(GatewayError::invalid(format!(
            "{} may only contain letters, digits, '_' and '-'",
            label
        )));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(GatewayError::invalid(format!("{} '{}' is reserved", label, id)));
    }
    Ok(())
}

/// Validate a filesystem path argument.
pub fn validate_path(path: &str, kind: PathKind, policy: &PathPolicy) -> Result<(), GatewayError> {
    let label = kind.label();

    if path.is_empty() {
        return Err(GatewayError::invalid(format!("{} must not be empty", label)));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(GatewayError::invalid(format!(
            "{} must be at most {} characters",
            label, MAX_PATH_LEN
        )));
    }
    if path.contains("..") || path.contains("//") {
        return Err(GatewayError::invalid(format!(
            "{} must not contain '..' or '//'",
            label
        )));
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'_' | b'-'))
    {
        return Err(GatewayError::invalid(format!(
            "{} contains characters outside [A-Za-z0-9/._-]",
            label
        )));
    }

    if kind == PathKind::Input && !policy.allowed_input_roots.is_empty() {
        let resolved = resolve(Path::new(path), policy.base_dir.as_deref());
        let allowed = policy
            .allowed_input_roots
            .iter()
            .any(|root| resolved.starts_with(resolve(root, policy.base_dir.as_deref())));
        if !allowed {
            return Err(GatewayError::invalid(format!(
                "{} is outside the allowed input directories",
                label
            )));
        }
    }

    Ok(())
}

/// Validate a requested compute capacity, returning it as an integer.
pub fn validate_compute_capacity(value: f64, max: u32) -> Result<u32, GatewayError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(GatewayError::invalid("compute_capacity must be an integer"));
    }
    if value < 1.0 || value > f64::from(max) {
        return Err(GatewayError::invalid(format!(
            "compute_capacity must be between 1 and {}",
            max
        )));
    }
    Ok(value as u32)
}

/// Extract a numeric capacity from a JSON value, accepting numeric strings.
pub fn capacity_from_json(value: &serde_json::Value) -> Result<f64, GatewayError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| GatewayError::invalid("compute_capacity must be a number")),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| GatewayError::invalid("compute_capacity must be a number")),
        _ => Err(GatewayError::invalid("compute_capacity must be a number")),
    }
}

/// Lexically resolve `path` to an absolute, normalized path.
fn resolve(path: &Path, base: Option<&Path>) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.unwrap_or_else(|| Path::new("/")).join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
