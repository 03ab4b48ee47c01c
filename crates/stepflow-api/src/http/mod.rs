//! HTTP/REST API layer for Stepflow.
//!
//! Axum-based REST API at `/api/v1/` with envelope response format,
//! CORS support and Server-Sent Events for live execution logs.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
