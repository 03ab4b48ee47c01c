//! Shared domain types for Stepflow.
//!
//! This crate contains the domain types used across the orchestrator:
//! workflow definitions, executions, task executions, log events, engine
//! configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
