//! HTTP API Module
//!
//! Exposes the election state for health checks and the `status` command.

mod http;

pub use http::{HealthResponse, HttpServer, StatusResponse};
