//! Query parameter extractors for list and stream endpoints.

use serde::Deserialize;
use uuid::Uuid;

use stepflow_core::repository::Page;
use stepflow_core::workflow::log_bus::LogFilter;
use stepflow_types::event::LogLevel;
use stepflow_types::execution::{ExecutionFilter, ExecutionStatus};

use crate::http::error::AppError;

/// Query parameters for the definition list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct DefinitionListQuery {
    pub tenant_id: Option<String>,
    pub offset: Option<u32>,
    /// Clamped to the configured maximum by the engine.
    pub limit: Option<u32>,
}

impl DefinitionListQuery {
    pub fn page(&self, default_limit: u32) -> Page {
        page(self.offset, self.limit, default_limit)
    }
}

/// Query parameters for the execution list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct ExecutionListQuery {
    pub definition_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    /// `pending`, `running`, `completed`, `failed`, `cancelled` or `timed_out`.
    pub status: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl ExecutionListQuery {
    pub fn filter(&self) -> Result<ExecutionFilter, AppError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<ExecutionStatus>)
            .transpose()
            .map_err(AppError::Validation)?;
        Ok(ExecutionFilter {
            definition_id: self.definition_id,
            tenant_id: self.tenant_id.clone(),
            status,
        })
    }

    pub fn page(&self, default_limit: u32) -> Page {
        page(self.offset, self.limit, default_limit)
    }
}

/// Query parameters for the log stream endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct LogStreamQuery {
    /// Only events of this task and the tasks nested under it.
    pub task_id: Option<String>,
    pub min_level: Option<String>,
}

impl LogStreamQuery {
    pub fn filter(&self) -> Result<LogFilter, AppError> {
        let min_level = self
            .min_level
            .as_deref()
            .map(str::parse::<LogLevel>)
            .transpose()
            .map_err(AppError::Validation)?
            .unwrap_or(LogLevel::Debug);
        Ok(LogFilter {
            task_id: self.task_id.clone(),
            min_level,
        })
    }
}

fn page(offset: Option<u32>, limit: Option<u32>, default_limit: u32) -> Page {
    Page::new(offset.unwrap_or(0), limit.unwrap_or(default_limit))
}
