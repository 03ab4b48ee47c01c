//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions and
//! task executions. The infrastructure layer (stepflow-infra) implements
//! this trait with SQLite persistence; [`super::memory`] provides an
//! in-process implementation.

use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{Execution, ExecutionFilter, TaskExecution};
use stepflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use super::{Page, Paginated};

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** CRUD for workflow definitions.
/// - **Executions:** Upsert/query execution records.
/// - **Tasks:** Upsert/query task execution records, keyed by
///   `(execution_id, task_id)`.
///
/// Each execution is written by a single owner, so plain upserts are enough
/// to avoid lost updates.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List workflow definitions, newest first, optionally filtered by tenant.
    fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> impl std::future::Future<Output = Result<Paginated<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by ID. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert an execution record.
    fn save_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions, newest first, matching the filter.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> impl std::future::Future<Output = Result<Paginated<Execution>, RepositoryError>> + Send;

    /// Number of executions that reference a definition.
    fn count_executions(
        &self,
        definition_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Upsert a task execution record.
    fn save_task(
        &self,
        task: &TaskExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all task records of an execution in creation order.
    fn list_tasks(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskExecution>, RepositoryError>> + Send;
}
