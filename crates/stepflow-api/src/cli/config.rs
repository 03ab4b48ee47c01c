//! `stepflow config` -- show or seed the engine configuration.

use anyhow::{Context, Result};
use console::style;

use stepflow_infra::config::{CONFIG_FILE, render_engine_config};

use crate::cli::output::print_json;
use crate::state::AppState;

pub async fn handle_config(state: &AppState, init: bool, json: bool) -> Result<()> {
    let config = state.engine.config();
    let path = state.data_dir.join(CONFIG_FILE);

    if init {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            println!(
                "  {} {} already exists, leaving it untouched",
                style("!").yellow().bold(),
                path.display()
            );
        } else {
            let rendered = render_engine_config(config).context("Failed to render configuration")?;
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "  {} Wrote {}",
                style("*").green().bold(),
                path.display()
            );
        }
        return Ok(());
    }

    if json {
        return print_json(config);
    }
    println!();
    println!("  {} {}", style("Data directory:").bold(), state.data_dir.display());
    println!();
    print!("{}", render_engine_config(config).context("Failed to render configuration")?);
    println!();
    Ok(())
}
