//! Request and result records exchanged between the dispatcher, processors
//! and the log store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::layout;

const DEFAULT_TIMEOUT_SECS: f64 = 600.0;
const DEFAULT_POST_TIMEOUT_SECS: f64 = 10.0;
const MAX_POST_WAIT_SECS: f64 = 5.0;

/// One `/cook` call, decoded leniently: absent fields fall back to their
/// defaults and are reported by validation rather than by deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobRequest {
    pub task_type: Option<String>,
    pub hip: String,
    pub cook_node: String,
    pub parm_node: Option<String>,
    pub uuid: String,
    pub parms: Option<Map<String, Value>>,
    pub hython: Option<String>,
    pub hfs: Option<String>,
    pub timeout_sec: Option<f64>,
    pub post_timeout_sec: Option<f64>,
    pub post_wait_sec: Option<f64>,
    pub user_id: Option<String>,
    pub request_time: Option<Value>,
}

impl JobRequest {
    pub fn from_body(body: &Value) -> Result<Self, TaskError> {
        if !body.is_object() {
            return Err(TaskError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        }
        let request: Self = serde_json::from_value(body.clone())
            .map_err(|e| TaskError::Validation(format!("malformed request: {e}")))?;

        let uuid = request.uuid.trim();
        if !uuid.is_empty() && !layout::is_safe_uuid(uuid) {
            return Err(TaskError::Validation(format!(
                "uuid must not contain path separators or '..': {uuid}"
            )));
        }
        Ok(request)
    }

    pub fn uuid(&self) -> &str {
        self.uuid.trim()
    }

    pub fn parm_node(&self) -> &str {
        match self.parm_node.as_deref().map(str::trim) {
            Some(node) if !node.is_empty() => node,
            _ => &self.cook_node,
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_sec, DEFAULT_TIMEOUT_SECS)
    }

    pub fn post_timeout(&self) -> Duration {
        seconds(self.post_timeout_sec, DEFAULT_POST_TIMEOUT_SECS)
    }

    /// Poll budget for the pixel file inside the post stage; never longer
    /// than the post stage itself.
    pub fn post_wait(&self) -> Duration {
        let post_timeout = self.post_timeout();
        let default_wait = post_timeout.min(Duration::from_secs_f64(MAX_POST_WAIT_SECS));
        match self.post_wait_sec {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::try_from_secs_f64(secs)
                .unwrap_or(default_wait)
                .min(post_timeout),
            _ => default_wait,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn request_time(&self) -> Option<&Value> {
        self.request_time.as_ref().filter(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    }
}

fn seconds(value: Option<f64>, default: f64) -> Duration {
    value
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

/// The normalized request echoed into the detail log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedRequest {
    pub task_type: String,
    pub hip: String,
    pub cook_node: String,
    pub parm_node: String,
    pub parms: Map<String, Value>,
}

/// The JSON object a worker prints on stdout. Fields the dispatcher does not
/// interpret are carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerReport {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_errors: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_parms: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerReport {
    pub fn has_node_level_errors(&self) -> bool {
        !self.node_errors.is_empty() || !self.missing_parms.is_empty()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.extra.get("error").and_then(Value::as_str)
    }
}

/// What one worker run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    /// Raw worker object, kept verbatim for the detail log and the response.
    pub worker_json: Option<Value>,
    #[serde(skip)]
    pub report: Option<WorkerReport>,
}

impl ExecutionResult {
    pub fn worker_ok(&self) -> bool {
        self.returncode == Some(0) && self.report.as_ref().is_some_and(|report| report.ok)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostProcessResult {
    pub ok: bool,
    pub returncode: Option<i32>,
    pub elapsed_ms_post: u64,
    #[serde(default)]
    pub stderr: String,
    pub json: Option<Value>,
}

/// Written once per uuid under `export/serve/log/detail/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailLogRecord {
    pub uuid: String,
    pub task_type: String,
    pub ok: bool,
    pub elapsed_ms_dispatch: u64,
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub worker_json: Option<Value>,
    /// The worker run as a whole, absent when no worker was started.
    #[serde(default)]
    pub execution: Option<ExecutionResult>,
    pub post: Option<PostProcessResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub request: NormalizedRequest,
    pub request_raw: Value,
    pub written_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStackEntry {
    pub process_name: String,
    pub uuid: String,
    pub request_time: Value,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStackLogRecord {
    pub user_id: String,
    #[serde(default)]
    pub stack: Vec<UserStackEntry>,
    #[serde(default)]
    pub history: Vec<UserStackEntry>,
    pub updated_at: String,
}
