//! In-memory `WorkflowRepository` backed by `DashMap`.
//!
//! Nothing survives the process. Used by tests and by `stepflow serve
//! --ephemeral`.

use dashmap::DashMap;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{Execution, ExecutionFilter, TaskExecution};
use stepflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use super::workflow::WorkflowRepository;
use super::{Page, Paginated};

#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    executions: DashMap<Uuid, Execution>,
    tasks: DashMap<Uuid, Vec<TaskExecution>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> Result<Paginated<WorkflowDefinition>, RepositoryError> {
        let mut all: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter(|d| tenant_id.is_none() || d.tenant_id.as_deref() == tenant_id)
            .map(|d| d.clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Paginated::from_vec(all, page))
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<Paginated<Execution>, RepositoryError> {
        let mut all: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| filter.definition_id.is_none_or(|id| e.definition_id == id))
            .filter(|e| {
                filter.tenant_id.is_none() || e.tenant_id.as_deref() == filter.tenant_id.as_deref()
            })
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .map(|e| e.clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Paginated::from_vec(all, page))
    }

    async fn count_executions(&self, definition_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.definition_id == *definition_id)
            .count() as u64)
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.entry(task.execution_id).or_default();
        match tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        Ok(())
    }

    async fn list_tasks(&self, execution_id: &Uuid) -> Result<Vec<TaskExecution>, RepositoryError> {
        Ok(self
            .tasks
            .get(execution_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use stepflow_types::execution::{ExecutionStatus, TaskStatus};
    use stepflow_types::workflow::StepKind;

    fn execution(definition_id: Uuid, status: ExecutionStatus) -> Execution {
        Execution {
            id: Uuid::now_v7(),
            definition_id,
            definition_name: "wf".to_string(),
            tenant_id: None,
            status,
            input: Map::new(),
            output: None,
            error: None,
            failed_task_id: None,
            trigger_id: None,
            triggered_by: None,
            retry_of: None,
            metadata: Map::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn task(execution_id: Uuid, task_id: &str, status: TaskStatus) -> TaskExecution {
        TaskExecution {
            execution_id,
            task_id: task_id.to_string(),
            step_id: task_id.to_string(),
            parent_task_id: None,
            iteration: None,
            kind: StepKind::Service,
            status,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_list_executions_filters_by_status_and_definition() {
        let repo = InMemoryWorkflowRepository::new();
        let def_a = Uuid::now_v7();
        let def_b = Uuid::now_v7();
        repo.save_execution(&execution(def_a, ExecutionStatus::Running)).await.unwrap();
        repo.save_execution(&execution(def_a, ExecutionStatus::Failed)).await.unwrap();
        repo.save_execution(&execution(def_b, ExecutionStatus::Failed)).await.unwrap();

        let failed = ExecutionFilter {
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        };
        let page = repo.list_executions(&failed, Page::default()).await.unwrap();
        assert_eq!(page.total, 2);

        let only_a = ExecutionFilter {
            definition_id: Some(def_a),
            ..Default::default()
        };
        let page = repo.list_executions(&only_a, Page::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(repo.count_executions(&def_b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_task_upserts_in_creation_order() {
        let repo = InMemoryWorkflowRepository::new();
        let exec_id = Uuid::now_v7();
        repo.save_task(&task(exec_id, "a", TaskStatus::Pending)).await.unwrap();
        repo.save_task(&task(exec_id, "b", TaskStatus::Pending)).await.unwrap();
        repo.save_task(&task(exec_id, "a", TaskStatus::Completed)).await.unwrap();

        let tasks = repo.list_tasks(&exec_id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "a");
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].task_id, "b");
        assert!(repo.list_tasks(&Uuid::now_v7()).await.unwrap().is_empty());
    }
}
