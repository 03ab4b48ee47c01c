//! Stepflow CLI and REST API entry point.
//!
//! Binary name: `stepflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the appropriate command handler or starts the REST
//! API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use stepflow_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = TracingOptions::from_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        options.default_directive = "error".to_string();
    }
    options.enable_otel = cli.otel;
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that never touch the data directory.
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "stepflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Cancel {
            execution_id,
            reason,
            server,
        } => {
            return cli::client::handle_cancel(&server, &execution_id, reason, cli.json).await;
        }
        Commands::Approve {
            execution_id,
            task_id,
            output,
            actor,
            server,
        } => {
            let body = cli::client::approval_body(&task_id, output.as_deref(), actor)?;
            return cli::client::handle_signal(&server, &execution_id, body, cli.json).await;
        }
        Commands::Reject {
            execution_id,
            task_id,
            reason,
            actor,
            server,
        } => {
            let body = cli::client::rejection_body(&task_id, reason, actor);
            return cli::client::handle_signal(&server, &execution_id, body, cli.json).await;
        }
        _ => {}
    }

    let ephemeral = matches!(cli.command, Commands::Serve { ephemeral: true, .. });
    let state = AppState::init(ephemeral).await?;

    match cli.command {
        Commands::Definition { command } => {
            cli::definition::handle_definition_command(command, &state, cli.json).await?;
        }

        Commands::Template { command } => {
            cli::definition::handle_template_command(command, &state, cli.json).await?;
        }

        Commands::Start {
            definition_id,
            input,
            params,
            trigger,
            min_level,
        } => {
            let args = cli::execution::StartArgs {
                definition_id,
                input,
                params,
                trigger,
                min_level,
            };
            cli::execution::handle_start(args, &state, cli.json, cli.quiet).await?;
        }

        Commands::Get { execution_id } => {
            cli::execution::handle_get(&execution_id, &state, cli.json).await?;
        }

        Commands::List {
            definition,
            tenant,
            status,
            offset,
            limit,
        } => {
            let args = cli::execution::ListArgs {
                definition,
                tenant,
                status,
                offset,
                limit,
            };
            cli::execution::handle_list(args, &state, cli.json).await?;
        }

        Commands::Logs { execution_id, task } => {
            cli::execution::handle_logs(&execution_id, task.as_deref(), &state, cli.json).await?;
        }

        Commands::Retry {
            execution_id,
            from_task,
            min_level,
        } => {
            cli::execution::handle_retry(
                &execution_id,
                from_task.as_deref(),
                &min_level,
                &state,
                cli.json,
                cli.quiet,
            )
            .await?;
        }

        Commands::Config { init } => {
            cli::config::handle_config(&state, init, cli.json).await?;
        }

        Commands::Serve { port, host, .. } => {
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Stepflow API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());
            tracing::info!(%addr, ephemeral, data_dir = %state.data_dir.display(), "server started");

            let router = http::router::build_router(state.clone());

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            let live = state.engine.live_executions();
            if live > 0 {
                tracing::warn!(live, "server stopped with executions still running");
            }
            println!("\n  Server stopped.");
        }

        // Handled before state initialization.
        Commands::Completions { .. }
        | Commands::Cancel { .. }
        | Commands::Approve { .. }
        | Commands::Reject { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
