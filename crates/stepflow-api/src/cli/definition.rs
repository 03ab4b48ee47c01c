//! CLI definition and template subcommands.
//!
//! Definitions are read from YAML (or JSON, by extension) files, validated,
//! and stored in the data directory database.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;

use stepflow_core::repository::Page;
use stepflow_core::workflow::definition::{
    load_definition_file, save_definition_file, serialize_definition_yaml,
};
use stepflow_types::workflow::WorkflowDefinition;

use crate::cli::output::{new_table, parse_id, parse_input, print_json, short_id};
use crate::state::AppState;

/// Definition management subcommands.
#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Register a definition from a YAML or JSON file.
    Create {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// List definitions, newest first.
    #[command(alias = "ls")]
    List {
        /// Only definitions of this tenant.
        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, default_value = "0")]
        offset: u32,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a definition as YAML.
    Show {
        /// Definition UUID.
        id: String,
    },

    /// Replace a definition with the contents of a file.
    Update {
        /// Definition UUID.
        id: String,

        /// Path to the definition file.
        file: PathBuf,
    },

    /// Delete a definition no execution references.
    #[command(alias = "rm")]
    Delete {
        /// Definition UUID.
        id: String,
    },

    /// Write a definition to a YAML file.
    Export {
        /// Definition UUID.
        id: String,

        /// Destination path.
        file: PathBuf,
    },
}

/// Template subcommands.
#[derive(Subcommand)]
pub enum TemplateCommand {
    /// List template definitions.
    #[command(alias = "ls")]
    List,

    /// Create a definition from a template, substituting `{{param}}` placeholders.
    Instantiate {
        /// Template definition UUID.
        template_id: String,

        /// Name of the new definition.
        name: String,

        /// Parameter overrides as a JSON object.
        #[arg(long)]
        params_json: Option<String>,

        /// Single parameter override as key=value.
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

/// Handle a definition subcommand.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Create { file } => handle_create(&file, state, json).await,
        DefinitionCommand::List {
            tenant,
            offset,
            limit,
        } => handle_list(tenant.as_deref(), offset, limit, state, json).await,
        DefinitionCommand::Show { id } => handle_show(&id, state, json).await,
        DefinitionCommand::Update { id, file } => handle_update(&id, &file, state, json).await,
        DefinitionCommand::Delete { id } => handle_delete(&id, state, json).await,
        DefinitionCommand::Export { id, file } => handle_export(&id, &file, state, json).await,
    }
}

/// Handle a template subcommand.
pub async fn handle_template_command(
    cmd: TemplateCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        TemplateCommand::List => handle_template_list(state, json).await,
        TemplateCommand::Instantiate {
            template_id,
            name,
            params_json,
            params,
        } => {
            let template_id = parse_id(&template_id, "template")?;
            let overrides = parse_input(params_json.as_deref(), &params)?;
            let def = state
                .engine
                .instantiate_template(template_id, &name, &overrides)
                .await?;

            if json {
                return print_json(&def);
            }
            println!();
            println!(
                "  {} Instantiated '{}' from template {}",
                style("*").green().bold(),
                style(&def.name).cyan(),
                short_id(&template_id)
            );
            println!("  ID: {}", def.id);
            println!("  Steps: {}", def.steps.len());
            println!();
            Ok(())
        }
    }
}

fn load_file(file: &Path) -> Result<WorkflowDefinition> {
    load_definition_file(file)
        .with_context(|| format!("Failed to load definition from {}", file.display()))
}

// ---------------------------------------------------------------------------
// Create / Update
// ---------------------------------------------------------------------------

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_file(file)?;
    let def = state.engine.create_definition(def).await?;

    if json {
        return print_json(&def);
    }
    println!();
    println!(
        "  {} Created definition '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    print_summary(&def);
    println!();
    Ok(())
}

async fn handle_update(id: &str, file: &Path, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "definition")?;
    let def = load_file(file)?;
    let def = state.engine.update_definition(id, def).await?;

    if json {
        return print_json(&def);
    }
    println!();
    println!(
        "  {} Updated definition '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    print_summary(&def);
    println!();
    Ok(())
}

fn print_summary(def: &WorkflowDefinition) {
    println!("  ID: {}", def.id);
    println!("  Version: {}", def.version);
    println!("  Steps: {}", def.steps.len());
    if !def.triggers.is_empty() {
        println!("  Triggers: {}", def.triggers.len());
    }
    if def.is_template {
        println!("  Template: yes");
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(
    tenant: Option<&str>,
    offset: u32,
    limit: Option<u32>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let limit = limit.unwrap_or(state.engine.config().default_page_limit);
    let page = state
        .engine
        .list_definitions(tenant, Page::new(offset, limit))
        .await?;

    if json {
        return print_json(&page);
    }

    if page.items.is_empty() {
        println!();
        println!("  No definitions registered.");
        println!(
            "  Create one with: {}",
            style("stepflow definition create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Name"),
        Cell::new("Version"),
        Cell::new("Steps"),
        Cell::new("Tenant"),
        Cell::new("Template"),
    ]);
    for d in &page.items {
        table.add_row(vec![
            Cell::new(d.id),
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(d.steps.len()),
            Cell::new(d.tenant_id.as_deref().unwrap_or("-")),
            Cell::new(if d.is_template { "yes" } else { "" }),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {}",
        style(format!(
            "showing {}-{} of {}",
            page.offset + 1,
            page.offset as usize + page.items.len(),
            page.total
        ))
        .dim()
    );
    println!();
    Ok(())
}

async fn handle_template_list(state: &AppState, json: bool) -> Result<()> {
    let max = state.engine.config().max_page_limit;
    let mut templates = Vec::new();
    let mut offset = 0;
    loop {
        let page = state
            .engine
            .list_definitions(None, Page::new(offset, max))
            .await?;
        let fetched = page.items.len() as u32;
        templates.extend(page.items.into_iter().filter(|d| d.is_template));
        offset += fetched;
        if fetched == 0 || u64::from(offset) >= page.total {
            break;
        }
    }

    if json {
        return print_json(&templates);
    }
    if templates.is_empty() {
        println!();
        println!("  No templates registered.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Name"),
        Cell::new("Parameters"),
    ]);
    for t in &templates {
        let params = t.parameters.keys().cloned().collect::<Vec<_>>().join(", ");
        table.add_row(vec![Cell::new(t.id), Cell::new(&t.name), Cell::new(params)]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show / Export / Delete
// ---------------------------------------------------------------------------

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "definition")?;
    let def = state.engine.get_definition(id).await?;

    if json {
        return print_json(&def);
    }
    let yaml = serialize_definition_yaml(&def)?;
    println!("{yaml}");
    Ok(())
}

async fn handle_export(id: &str, file: &Path, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "definition")?;
    let def = state.engine.get_definition(id).await?;
    save_definition_file(file, &def)
        .with_context(|| format!("Failed to write {}", file.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "id": def.id,
            "path": file.display().to_string(),
        }));
    }
    println!();
    println!(
        "  {} Exported '{}' to {}",
        style("*").green().bold(),
        style(&def.name).cyan(),
        file.display()
    );
    println!();
    Ok(())
}

async fn handle_delete(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "definition")?;
    state.engine.delete_definition(id).await?;

    if json {
        return print_json(&serde_json::json!({ "id": id, "deleted": true }));
    }
    println!();
    println!("  {} Deleted definition {}", style("*").green().bold(), id);
    println!();
    Ok(())
}
