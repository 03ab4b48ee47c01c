//! REST API request handlers.

pub mod definition;
pub mod execution;
pub mod logs;
