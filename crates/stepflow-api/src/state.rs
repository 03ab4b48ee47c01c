//! Application state wiring the engine together.
//!
//! AppState holds the engine used by both CLI commands and REST handlers.
//! The engine is generic over its repository; [`EngineRepository`] pins it to
//! either the SQLite store in the data directory or, for `serve --ephemeral`
//! and tests, the in-memory store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stepflow_core::repository::memory::InMemoryWorkflowRepository;
use stepflow_core::repository::workflow::WorkflowRepository;
use stepflow_core::repository::{Page, Paginated};
use stepflow_core::workflow::engine::WorkflowEngine;
use stepflow_infra::config::load_engine_config;
use stepflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use stepflow_infra::invoker::HttpServiceInvoker;
use stepflow_infra::sqlite::pool::DatabasePool;
use stepflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepflow_types::config::EngineConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{Execution, ExecutionFilter, TaskExecution};
use stepflow_types::workflow::{StepKind, WorkflowDefinition};
use uuid::Uuid;

/// Concrete engine type used by the binary.
pub type ConcreteEngine = WorkflowEngine<EngineRepository>;

/// Repository selected at startup.
pub enum EngineRepository {
    Sqlite(SqliteWorkflowRepository),
    Memory(InMemoryWorkflowRepository),
}

impl WorkflowRepository for EngineRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.save_definition(def).await,
            Self::Memory(repo) => repo.save_definition(def).await,
        }
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.get_definition(id).await,
            Self::Memory(repo) => repo.get_definition(id).await,
        }
    }

    async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> Result<Paginated<WorkflowDefinition>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_definitions(tenant_id, page).await,
            Self::Memory(repo) => repo.list_definitions(tenant_id, page).await,
        }
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.delete_definition(id).await,
            Self::Memory(repo) => repo.delete_definition(id).await,
        }
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.save_execution(execution).await,
            Self::Memory(repo) => repo.save_execution(execution).await,
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.get_execution(id).await,
            Self::Memory(repo) => repo.get_execution(id).await,
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<Paginated<Execution>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_executions(filter, page).await,
            Self::Memory(repo) => repo.list_executions(filter, page).await,
        }
    }

    async fn count_executions(&self, definition_id: &Uuid) -> Result<u64, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.count_executions(definition_id).await,
            Self::Memory(repo) => repo.count_executions(definition_id).await,
        }
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.save_task(task).await,
            Self::Memory(repo) => repo.save_task(task).await,
        }
    }

    async fn list_tasks(&self, execution_id: &Uuid) -> Result<Vec<TaskExecution>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_tasks(execution_id).await,
            Self::Memory(repo) => repo.list_tasks(execution_id).await,
        }
    }
}

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: resolve the data directory, load
    /// `config.toml`, open the database (unless `ephemeral`) and build the engine.
    pub async fn init(ephemeral: bool) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let repo = if ephemeral {
            tracing::info!("using in-memory repository; executions are not persisted");
            EngineRepository::Memory(InMemoryWorkflowRepository::new())
        } else {
            let pool = DatabasePool::open_in(&data_dir)
                .await
                .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
            EngineRepository::Sqlite(SqliteWorkflowRepository::new(pool))
        };

        Self::with_repository(repo, config, data_dir)
    }

    /// Build the engine over an already opened repository.
    pub fn with_repository(
        repo: EngineRepository,
        config: EngineConfig,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let invoker = HttpServiceInvoker::new(&config.http_invoker)
            .context("Failed to build HTTP service invoker")?;

        let engine = WorkflowEngine::builder(Arc::new(repo))
            .config(config)
            .invoker(StepKind::Service, Arc::new(invoker))
            .build();

        Ok(Self { engine, data_dir })
    }
}
