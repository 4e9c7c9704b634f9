//! Proofgate - an HTTP gateway and process supervisor for a gRPC proof coordinator
//!
//! This library provides a gateway that:
//! - Validates and rate-limits operator requests before anything reaches the coordinator
//! - Forwards them as gRPC calls with explicit deadlines and sanitized errors
//! - Rejects duplicate launches for a block that already has an active job
//! - Discovers, starts, inspects and stops the coordinator and worker processes
//! - Records admission decisions and process actions as structured audit events

pub mod api;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod inspector;
pub mod launch;
pub mod proto;
pub mod ratelimit;
pub mod rpc;
pub mod sanitize;
pub mod server;
pub mod supervisor;
pub mod validate;
