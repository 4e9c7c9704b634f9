//! Structured audit events for admission decisions and process actions
//!
//! Events are serialized to a single JSON line and emitted on the `audit`
//! tracing target. Nothing is kept in memory, and emission never fails: the
//! response path must not depend on whether an event could be recorded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

/// Outcome attached to an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Rejected,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            client: None,
            decision: None,
            reason: None,
            fields: Map::new(),
        }
    }

    pub fn client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }
        match event.to_json() {
            Some(payload) => info!(target: "audit", event = event.event, %payload),
            None => info!(target: "audit", event = event.event, "audit payload not serializable"),
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(true)
    }
}
