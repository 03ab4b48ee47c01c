//! Workflow engine core: validation, scheduling, retries and compensation.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `dag` -- cycle detection, downstream closure, reverse dependency order
//! - `placeholder` -- `{{ ... }}` substitution over JSON values
//! - `context` -- evaluation scope of a task (params, step outputs, loop vars)
//! - `expression` -- expression evaluator port and the JEXL default
//! - `retry` -- retry policy engine (attempt budget and backoff)
//! - `invoker` -- step invoker port, deadline handling, registry
//! - `kinds` -- step-kind handler table
//! - `task_graph` -- runtime task instances and readiness
//! - `scheduler` -- per-execution actor driving a task graph to completion
//! - `compensation` -- error handler effects and compensation runs
//! - `log_bus` -- live per-execution log fan-out
//! - `template` -- template instantiation
//! - `engine` -- the `WorkflowEngine` facade

pub mod compensation;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod invoker;
pub mod kinds;
pub mod log_bus;
pub mod placeholder;
pub mod retry;
pub mod scheduler;
pub mod task_graph;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;
