use anyhow::Result;
use serde_json::Value;

use crate::error::TaskError;
use crate::processors::common;
use crate::request::JobRequest;

/// What a processor hands back to the dispatcher. `body` always carries the
/// same `ok` at its top level.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub ok: bool,
    pub body: Value,
}

/// One kind of engine task.
///
/// Processors are synchronous; the dispatcher runs `execute` on the blocking
/// pool. `execute` owns the detail log for its uuid and writes it on every
/// path past validation.
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> &str;

    /// Ordered field names that must be present and non-empty.
    fn required_fields(&self) -> &[&'static str];

    fn validate(&self, body: &Value) -> Result<JobRequest, TaskError> {
        common::validate_required(body, self.required_fields())
    }

    fn execute(&self, request: JobRequest, raw: &Value) -> Result<TaskResponse>;
}
