//! Mapping of upstream RPC failures onto the client-facing error taxonomy
//!
//! Transport errors tend to carry socket addresses, file paths and protobuf
//! type names. None of that may leave the gateway, so messages are redacted
//! and length-capped before they are wrapped in a [`GatewayError`].

use crate::error::GatewayError;
use once_cell::sync::Lazy;
use regex::Regex;
use tonic::{Code, Status};

/// Longest message forwarded to a client
pub const MAX_MESSAGE_LEN: usize = 200;

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z][a-zA-Z0-9+.-]*://[^\s,;)]+").expect("valid regex"));

static HOST_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\[[0-9A-Fa-f:.]+\]|\b[A-Za-z0-9][A-Za-z0-9.-]*):\d{1,5}\b").expect("valid regex")
});

static PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z]:)?(?:[/\\][A-Za-z0-9._-]+){2,}[/\\]?").expect("valid regex")
});

/// A lone path segment such as `/secrets` or `C:\coord.toml`, only where a
/// path can start so that words like `read/write` survive
static ROOTED_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s:(='"])(?:[A-Za-z]:)?[/\\][A-Za-z0-9._-]+[/\\]?"#).expect("valid regex")
});

static PROTO_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)*\.[A-Z][A-Za-z0-9_]*(?:/[A-Za-z0-9_]+)?\b")
        .expect("valid regex")
});

/// Remove addresses, URLs, paths and proto identifiers, and cap the length.
pub fn redact(message: &str) -> String {
    let out = URL.replace_all(message, "[url]");
    let out = HOST_PORT.replace_all(&out, "[addr]");
    let out = PATH.replace_all(&out, "[path]");
    let out = ROOTED_SEGMENT.replace_all(&out, "${1}[path]");
    let out = PROTO_IDENT.replace_all(&out, "[ident]");
    truncate(out.trim())
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_MESSAGE_LEN).collect();
    out.push_str("...");
    out
}

/// Map a gRPC status onto the gateway taxonomy with a redacted message.
///
/// `method` names the call for timeout reporting; `timeout` is the deadline
/// that was configured for it.
pub fn sanitize_status(
    status: &Status,
    method: &'static str,
    timeout: std::time::Duration,
) -> GatewayError {
    let detail = redact(status.message());
    let detail = if detail.is_empty() {
        status.code().description().to_string()
    } else {
        detail
    };

    match status.code() {
        Code::InvalidArgument | Code::OutOfRange => GatewayError::InvalidArgument(detail),
        Code::NotFound => GatewayError::NotFound(detail),
        Code::AlreadyExists | Code::Aborted => GatewayError::Conflict(detail),
        Code::Unavailable => GatewayError::Unavailable(format!(
            "Coordinator is unavailable: {}",
            detail
        )),
        Code::ResourceExhausted | Code::FailedPrecondition => GatewayError::Unavailable(detail),
        Code::DeadlineExceeded => GatewayError::Timeout { method, timeout },
        Code::Cancelled => GatewayError::Cancelled(
            "The coordinator cancelled the request. This usually means no workers are connected; start a worker and retry."
                .to_string(),
        ),
        _ => GatewayError::Internal(format!("Coordinator error: {}", detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;

    #[test]
    fn test_redacts_host_port() {
        let out = redact("failed to connect to 10.1.2.3:50051: connection refused");
        assert!(!out.contains("10.1.2.3"));
        assert!(!out.contains("50051"));
        assert!(out.contains("[addr]"));
        assert!(out.contains("connection refused"));

        let out = redact("dial coordinator.internal:443 failed");
        assert_eq!(out, "dial [addr] failed");

        let out = redact("peer [::1]:50051 reset");
        assert_eq!(out, "peer [addr] reset");
    }

    #[test]
    fn test_redacts_urls() {
        let out = redact("error trying to connect: http://127.0.0.1:50051/coordinator.v1");
        assert_eq!(out, "error trying to connect: [url]");
    }

    #[test]
    fn test_redacts_paths() {
        let out = redact("cannot open /home/ops/inputs/block.bin: no such file");
        assert_eq!(out, "cannot open [path]: no such file");

        let out = redact(r"missing C:\zisk\bin\worker.exe");
        assert_eq!(out, "missing [path]");
    }

    #[test]
    fn test_redacts_single_segment_paths() {
        assert_eq!(redact("open /secrets: denied"), "open [path]: denied");
        assert_eq!(redact(r"cannot read C:\coord.toml"), "cannot read [path]");
        assert_eq!(redact("/etc"), "[path]");
        assert_eq!(redact("config='/run'"), "config='[path]'");
        assert_eq!(redact("open failed:/data"), "open failed:[path]");

        // Slashes inside words are not paths
        assert_eq!(redact("read/write failed"), "read/write failed");
        assert_eq!(redact("1 / 2 workers"), "1 / 2 workers");
    }

    #[test]
    fn test_redacts_proto_identifiers() {
        let out = redact("failed to decode coordinator.v1.LaunchProofResponse");
        assert_eq!(out, "failed to decode [ident]");
    }

    #[test]
    fn test_plain_messages_are_untouched() {
        assert_eq!(redact("no idle workers"), "no idle workers");
        assert_eq!(redact("  job not found  "), "job not found");
    }

    #[test]
    fn test_truncates_long_messages() {
        let out = redact(&"x".repeat(MAX_MESSAGE_LEN + 50));
        assert_eq!(out.chars().count(), MAX_MESSAGE_LEN + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_status_code_mapping() {
        let t = Duration::from_secs(5);
        let cases = [
            (Code::InvalidArgument, ErrorCode::InvalidArgument),
            (Code::OutOfRange, ErrorCode::InvalidArgument),
            (Code::NotFound, ErrorCode::NotFound),
            (Code::AlreadyExists, ErrorCode::Conflict),
            (Code::Unavailable, ErrorCode::Unavailable),
            (Code::ResourceExhausted, ErrorCode::Unavailable),
            (Code::FailedPrecondition, ErrorCode::Unavailable),
            (Code::DeadlineExceeded, ErrorCode::Timeout),
            (Code::Cancelled, ErrorCode::Cancelled),
            (Code::Internal, ErrorCode::Internal),
            (Code::Unknown, ErrorCode::Internal),
            (Code::PermissionDenied, ErrorCode::Internal),
        ];
        for (code, expected) in cases {
            let err = sanitize_status(&Status::new(code, "boom"), "JobsList", t);
            assert_eq!(err.code(), expected, "{code:?}");
        }
    }

    #[test]
    fn test_sanitized_status_has_no_address() {
        let status = Status::unavailable("tcp connect error: 192.168.1.20:50051 refused");
        let err = sanitize_status(&status, "SystemStatus", Duration::from_secs(1));
        let message = err.to_string();
        assert!(!message.contains("192.168.1.20"));
        assert!(message.starts_with("Coordinator is unavailable"));
    }

    #[test]
    fn test_empty_message_falls_back_to_code_description() {
        let err = sanitize_status(&Status::new(Code::Internal, ""), "JobsList", Duration::from_secs(1));
        assert!(err.to_string().starts_with("Coordinator error: "));
        assert!(err.to_string().len() > "Coordinator error: ".len());
    }
}
