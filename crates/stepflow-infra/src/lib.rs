//! Infrastructure layer for Stepflow.
//!
//! Contains implementations of the ports defined in `stepflow-core`: the
//! SQLite workflow repository, the HTTP Service step invoker, the
//! `config.toml` loader and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod invoker;
pub mod sqlite;
