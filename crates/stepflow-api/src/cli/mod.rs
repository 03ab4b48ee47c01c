//! CLI command definitions and dispatch for the `stepflow` binary.
//!
//! Uses clap derive macros for argument parsing. Definitions and templates
//! are managed under `stepflow definition ...` / `stepflow template ...`;
//! execution commands sit at the top level (`stepflow start <definition>`).
//!
//! `start` and `retry` run the execution in this process and follow its logs
//! until it finishes. `cancel`, `approve` and `reject` act on executions
//! owned by a running `stepflow serve` and go through its REST API.

pub mod client;
pub mod config;
pub mod definition;
pub mod execution;
pub mod output;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

pub use definition::{DefinitionCommand, TemplateCommand};

/// Default REST endpoint of `stepflow serve`.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";

/// Run and inspect workflow executions.
#[derive(Parser)]
#[command(name = "stepflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        command: DefinitionCommand,
    },

    /// Work with workflow templates.
    Template {
        #[command(subcommand)]
        command: TemplateCommand,
    },

    /// Start an execution and follow it until it finishes.
    Start {
        /// Definition UUID.
        definition_id: String,

        /// Execution input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Single input parameter as key=value (value parsed as JSON, else string).
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Trigger id recorded on the execution.
        #[arg(long, default_value = "cli")]
        trigger: String,

        /// Minimum log level to print (debug, info, warn, error).
        #[arg(long, default_value = "info")]
        min_level: String,
    },

    /// Show an execution with its task records.
    Get {
        /// Execution UUID.
        execution_id: String,
    },

    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Only executions of this definition.
        #[arg(long)]
        definition: Option<String>,

        /// Only executions of this tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Only executions in this status.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "0")]
        offset: u32,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show the task history of an execution.
    Logs {
        /// Execution UUID.
        execution_id: String,

        /// Only this task and the tasks nested under it.
        #[arg(long)]
        task: Option<String>,
    },

    /// Retry a failed, cancelled or timed-out execution and follow it.
    Retry {
        /// Execution UUID.
        execution_id: String,

        /// Resume from this task, reusing upstream outputs.
        #[arg(long)]
        from_task: Option<String>,

        /// Minimum log level to print (debug, info, warn, error).
        #[arg(long, default_value = "info")]
        min_level: String,
    },

    /// Cancel an execution running in `stepflow serve`.
    Cancel {
        /// Execution UUID.
        execution_id: String,

        /// Reason recorded on the execution.
        #[arg(long)]
        reason: Option<String>,

        /// REST endpoint of the server owning the execution.
        #[arg(long, env = "STEPFLOW_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Approve a waiting human task.
    Approve {
        /// Execution UUID.
        execution_id: String,

        /// Human task id (e.g. `review` or `release/signoff`).
        task_id: String,

        /// Task output as JSON (defaults to an approval record).
        #[arg(long)]
        output: Option<String>,

        /// Who approved.
        #[arg(long)]
        actor: Option<String>,

        #[arg(long, env = "STEPFLOW_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Reject a waiting human task.
    Reject {
        /// Execution UUID.
        execution_id: String,

        /// Human task id.
        task_id: String,

        #[arg(long)]
        reason: Option<String>,

        /// Who rejected.
        #[arg(long)]
        actor: Option<String>,

        #[arg(long, env = "STEPFLOW_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Show or initialize the engine configuration.
    Config {
        /// Write the effective configuration to `config.toml` if it does not exist.
        #[arg(long)]
        init: bool,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Keep everything in memory instead of the data directory database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
