//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs next to the columns
//! used for filtering; executions and task executions are stored column by
//! column with JSON-encoded inputs, outputs and metadata. Task rows keep
//! their insertion order, which is the order the scheduler created them in.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use stepflow_core::repository::workflow::WorkflowRepository;
use stepflow_core::repository::{Page, Paginated};
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{
    Execution, ExecutionFilter, ExecutionStatus, TaskExecution, TaskStatus,
};
use stepflow_types::workflow::{StepKind, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    definition_id: String,
    definition_name: String,
    tenant_id: Option<String>,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    failed_task_id: Option<String>,
    trigger_id: Option<String>,
    triggered_by: Option<String>,
    retry_of: Option<String>,
    metadata: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_name: row.try_get("definition_name")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            failed_task_id: row.try_get("failed_task_id")?,
            trigger_id: row.try_get("trigger_id")?,
            triggered_by: row.try_get("triggered_by")?,
            retry_of: row.try_get("retry_of")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid execution status: {}", self.status)))?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_name: self.definition_name,
            tenant_id: self.tenant_id,
            status,
            input: parse_object(&self.input, "execution input")?,
            output: parse_optional_json(self.output.as_deref(), "execution output")?,
            error: self.error,
            failed_task_id: self.failed_task_id,
            trigger_id: self.trigger_id,
            triggered_by: self.triggered_by,
            retry_of: self.retry_of.as_deref().map(parse_uuid).transpose()?,
            metadata: parse_object(&self.metadata, "execution metadata")?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct TaskRow {
    execution_id: String,
    task_id: String,
    step_id: String,
    parent_task_id: Option<String>,
    iteration: Option<i64>,
    kind: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    retry_count: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            task_id: row.try_get("task_id")?,
            step_id: row.try_get("step_id")?,
            parent_task_id: row.try_get("parent_task_id")?,
            iteration: row.try_get("iteration")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<TaskExecution, RepositoryError> {
        let kind: StepKind = serde_json::from_value(Value::String(self.kind.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid step kind: {}", self.kind)))?;
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid task status: {}", self.status)))?;

        Ok(TaskExecution {
            execution_id: parse_uuid(&self.execution_id)?,
            task_id: self.task_id,
            step_id: self.step_id,
            parent_task_id: self.parent_task_id,
            iteration: self.iteration.map(|i| i as u32),
            kind,
            status,
            input: parse_optional_json(self.input.as_deref(), "task input")?,
            output: parse_optional_json(self.output.as_deref(), "task output")?,
            error: self.error,
            retry_count: self.retry_count as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_object(s: &str, what: &str) -> Result<Map<String, Value>, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
}

fn parse_optional_json(s: Option<&str>, what: &str) -> Result<Option<Value>, RepositoryError> {
    s.map(|s| {
        serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
    })
    .transpose()
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn to_optional_json(value: Option<&Value>) -> Result<Option<String>, RepositoryError> {
    value.map(|v| to_json(v)).transpose()
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, name, tenant_id, is_template, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 tenant_id = excluded.tenant_id,
                 is_template = excluded.is_template,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.tenant_id)
        .bind(def.is_template)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("definition").map_err(query_error)?;
                serde_json::from_str(&json).map(Some).map_err(|e| {
                    RepositoryError::Query(format!("invalid workflow definition JSON: {e}"))
                })
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> Result<Paginated<WorkflowDefinition>, RepositoryError> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workflow_definitions WHERE (?1 IS NULL OR tenant_id = ?1)",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let rows = sqlx::query(
            r#"SELECT definition FROM workflow_definitions
               WHERE (?1 IS NULL OR tenant_id = ?1)
               ORDER BY created_at DESC, id DESC
               LIMIT ?2 OFFSET ?3"#,
        )
        .bind(tenant_id)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.try_get("definition").map_err(query_error)?;
            items.push(serde_json::from_str(&json).map_err(|e| {
                RepositoryError::Query(format!("invalid workflow definition JSON: {e}"))
            })?);
        }

        Ok(Paginated {
            items,
            total: total as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    RepositoryError::Conflict(format!("definition {id} is still referenced"))
                }
                other => query_error(other),
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (id, definition_id, definition_name, tenant_id, status, input, output,
                error, failed_task_id, trigger_id, triggered_by, retry_of, metadata,
                created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 output = excluded.output,
                 error = excluded.error,
                 failed_task_id = excluded.failed_task_id,
                 metadata = excluded.metadata,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.definition_id.to_string())
        .bind(&execution.definition_name)
        .bind(&execution.tenant_id)
        .bind(execution.status.as_str())
        .bind(to_json(&execution.input)?)
        .bind(to_optional_json(execution.output.as_ref())?)
        .bind(&execution.error)
        .bind(&execution.failed_task_id)
        .bind(&execution.trigger_id)
        .bind(&execution.triggered_by)
        .bind(execution.retry_of.map(|id| id.to_string()))
        .bind(to_json(&execution.metadata)?)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<Paginated<Execution>, RepositoryError> {
        const WHERE: &str = r#"WHERE (?1 IS NULL OR definition_id = ?1)
               AND (?2 IS NULL OR tenant_id = ?2)
               AND (?3 IS NULL OR status = ?3)"#;

        let definition_id = filter.definition_id.map(|id| id.to_string());
        let status = filter.status.map(|s| s.as_str());

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM executions {WHERE}"))
            .bind(&definition_id)
            .bind(&filter.tenant_id)
            .bind(status)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM executions {WHERE} ORDER BY created_at DESC, id DESC LIMIT ?4 OFFSET ?5"
        ))
        .bind(&definition_id)
        .bind(&filter.tenant_id)
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            items.push(r.into_execution()?);
        }

        Ok(Paginated {
            items,
            total: total as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn count_executions(&self, definition_id: &Uuid) -> Result<u64, RepositoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM executions WHERE definition_id = ?")
                .bind(definition_id.to_string())
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_error)?;
        Ok(count as u64)
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<(), RepositoryError> {
        let kind = task.kind.to_string();

        sqlx::query(
            r#"INSERT INTO task_executions
               (execution_id, task_id, step_id, parent_task_id, iteration, kind, status,
                input, output, error, retry_count, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, task_id) DO UPDATE SET
                 status = excluded.status,
                 input = excluded.input,
                 output = excluded.output,
                 error = excluded.error,
                 retry_count = excluded.retry_count,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(task.execution_id.to_string())
        .bind(&task.task_id)
        .bind(&task.step_id)
        .bind(&task.parent_task_id)
        .bind(task.iteration.map(i64::from))
        .bind(&kind)
        .bind(task.status.as_str())
        .bind(to_optional_json(task.input.as_ref())?)
        .bind(to_optional_json(task.output.as_ref())?)
        .bind(&task.error)
        .bind(i64::from(task.retry_count))
        .bind(task.started_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                RepositoryError::NotFound
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn list_tasks(&self, execution_id: &Uuid) -> Result<Vec<TaskExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM task_executions WHERE execution_id = ? ORDER BY rowid ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskRow::from_row(row).map_err(query_error)?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::workflow::{StepConfig, StepDefinition};

    async fn test_repo() -> (SqliteWorkflowRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (SqliteWorkflowRepository::new(pool), dir)
    }

    fn sample_definition(name: &str, tenant: Option<&str>) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: Some("Charge and ship an order".to_string()),
            version: "1.0.0".to_string(),
            tenant_id: tenant.map(str::to_string),
            steps: vec![StepDefinition {
                id: "charge".to_string(),
                name: "Charge card".to_string(),
                depends_on: vec![],
                retry: None,
                input: Map::new(),
                config: StepConfig::Service {
                    target: "billing".to_string(),
                    method: "charge".to_string(),
                    timeout_ms: Some(5_000),
                },
            }],
            triggers: Vec::new(),
            error_handler: None,
            parameters: Map::new(),
            timeout_ms: None,
            is_template: false,
            template_id: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_execution(def: &WorkflowDefinition, status: ExecutionStatus) -> Execution {
        let mut input = Map::new();
        input.insert("order_id".to_string(), json!(42));
        Execution {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_name: def.name.clone(),
            tenant_id: def.tenant_id.clone(),
            status,
            input,
            output: None,
            error: None,
            failed_task_id: None,
            trigger_id: Some("manual".to_string()),
            triggered_by: Some("alice".to_string()),
            retry_of: None,
            metadata: Map::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn sample_task(execution_id: Uuid, task_id: &str) -> TaskExecution {
        TaskExecution {
            execution_id,
            task_id: task_id.to_string(),
            step_id: task_id.rsplit('/').next().unwrap_or(task_id).to_string(),
            parent_task_id: None,
            iteration: None,
            kind: StepKind::Service,
            status: TaskStatus::Pending,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_definition_round_trip_and_upsert() {
        let (repo, _dir) = test_repo().await;
        let mut def = sample_definition("order", None);
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "order");
        assert_eq!(loaded.steps, def.steps);

        def.name = "order-v2".to_string();
        def.is_template = true;
        repo.save_definition(&def).await.unwrap();
        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "order-v2");
        assert!(loaded.is_template);

        assert!(repo.delete_definition(&def.id).await.unwrap());
        assert!(!repo.delete_definition(&def.id).await.unwrap());
        assert!(repo.get_definition(&def.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_definitions_by_tenant_newest_first() {
        let (repo, _dir) = test_repo().await;
        let first = sample_definition("first", Some("acme"));
        repo.save_definition(&first).await.unwrap();
        let mut second = sample_definition("second", Some("acme"));
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        repo.save_definition(&second).await.unwrap();
        repo.save_definition(&sample_definition("other", Some("globex")))
            .await
            .unwrap();

        let acme = repo
            .list_definitions(Some("acme"), Page::new(0, 10))
            .await
            .unwrap();
        assert_eq!(acme.total, 2);
        let names: Vec<&str> = acme.items.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);

        let all = repo.list_definitions(None, Page::new(1, 1)).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items.len(), 1);
        assert_eq!(all.offset, 1);
    }

    #[tokio::test]
    async fn test_execution_round_trip_and_update() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition("order", None);
        repo.save_definition(&def).await.unwrap();

        let mut execution = sample_execution(&def, ExecutionStatus::Pending);
        repo.save_execution(&execution).await.unwrap();

        execution.status = ExecutionStatus::Failed;
        execution.error = Some("invocation failed: card declined".to_string());
        execution.failed_task_id = Some("charge".to_string());
        execution.output = Some(json!({"charge": null}));
        execution
            .metadata
            .insert("compensation".to_string(), json!({"succeeded": ["charge"]}));
        execution.started_at = Some(Utc::now());
        execution.completed_at = Some(Utc::now());
        repo.save_execution(&execution).await.unwrap();

        let loaded = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.failed_task_id.as_deref(), Some("charge"));
        assert_eq!(loaded.input["order_id"], json!(42));
        assert_eq!(loaded.output, Some(json!({"charge": null})));
        assert_eq!(loaded.metadata["compensation"]["succeeded"], json!(["charge"]));
        assert_eq!(loaded.triggered_by.as_deref(), Some("alice"));
        assert!(loaded.completed_at.is_some());
        assert_eq!(repo.count_executions(&def.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_executions_filters() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition("order", Some("acme"));
        let other = sample_definition("refund", None);
        repo.save_definition(&def).await.unwrap();
        repo.save_definition(&other).await.unwrap();

        let completed = sample_execution(&def, ExecutionStatus::Completed);
        let mut failed = sample_execution(&def, ExecutionStatus::Failed);
        failed.retry_of = Some(completed.id);
        let unrelated = sample_execution(&other, ExecutionStatus::Completed);
        for e in [&completed, &failed, &unrelated] {
            repo.save_execution(e).await.unwrap();
        }

        let by_def = ExecutionFilter {
            definition_id: Some(def.id),
            ..Default::default()
        };
        assert_eq!(repo.list_executions(&by_def, Page::default()).await.unwrap().total, 2);

        let by_status = ExecutionFilter {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        };
        assert_eq!(
            repo.list_executions(&by_status, Page::default())
                .await
                .unwrap()
                .total,
            2
        );

        let by_tenant = ExecutionFilter {
            tenant_id: Some("acme".to_string()),
            status: Some(ExecutionStatus::Failed),
            ..Default::default()
        };
        let page = repo.list_executions(&by_tenant, Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].retry_of, Some(completed.id));

        let everything = repo
            .list_executions(&ExecutionFilter::default(), Page::new(0, 2))
            .await
            .unwrap();
        assert_eq!(everything.total, 3);
        assert_eq!(everything.items.len(), 2);
    }

    #[tokio::test]
    async fn test_referenced_definition_cannot_be_deleted() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition("order", None);
        repo.save_definition(&def).await.unwrap();
        repo.save_execution(&sample_execution(&def, ExecutionStatus::Running))
            .await
            .unwrap();

        let result = repo.delete_definition(&def.id).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_tasks_upsert_in_creation_order() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition("order", None);
        repo.save_definition(&def).await.unwrap();
        let execution = sample_execution(&def, ExecutionStatus::Running);
        repo.save_execution(&execution).await.unwrap();

        let mut parent = sample_task(execution.id, "fanout");
        parent.kind = StepKind::Loop;
        let mut child = sample_task(execution.id, "fanout[3]/notify");
        child.parent_task_id = Some("fanout".to_string());
        child.iteration = Some(3);
        repo.save_task(&parent).await.unwrap();
        repo.save_task(&child).await.unwrap();

        parent.status = TaskStatus::Completed;
        parent.output = Some(json!([{"notify": {"sent": true}}]));
        parent.retry_count = 2;
        parent.completed_at = Some(Utc::now());
        repo.save_task(&parent).await.unwrap();

        let tasks = repo.list_tasks(&execution.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_id, "fanout");
        assert_eq!(tasks[0].kind, StepKind::Loop);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].retry_count, 2);
        assert_eq!(tasks[0].output, parent.output);
        assert_eq!(tasks[1].task_id, "fanout[3]/notify");
        assert_eq!(tasks[1].step_id, "notify");
        assert_eq!(tasks[1].iteration, Some(3));
        assert_eq!(tasks[1].parent_task_id.as_deref(), Some("fanout"));

        assert!(repo.list_tasks(&Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_for_unknown_execution_rejected() {
        let (repo, _dir) = test_repo().await;
        let result = repo.save_task(&sample_task(Uuid::now_v7(), "a")).await;
        assert!(matches!(result, Err(RepositoryError::NotFound)));
    }
}
