//! Business logic and repository trait definitions for Stepflow.
//!
//! This crate defines the "ports" (repository and step invoker traits) that
//! the infrastructure layer implements, plus the orchestration core itself:
//! validation, scheduling, retry, compensation and log streaming. It depends
//! only on `stepflow-types` -- never on `stepflow-infra` or any database/IO crate.

pub mod repository;
pub mod workflow;
