use thiserror::Error;

use crate::process::RunError;

/// Failure classes a task can end in.
///
/// Validation failures are raised before any worker is spawned and never
/// produce a detail log. Every other class is recorded in the detail log
/// together with the raw request.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Resolution(String),

    #[error("{message}")]
    Infrastructure {
        message: String,
        returncode: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("worker timed out after {timeout_secs}s and was terminated")]
    Timeout {
        timeout_secs: f64,
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("{0}")]
    NodeLevel(String),

    #[error("post-processing failed: {0}")]
    PostProcessing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "validation",
            TaskError::Resolution(_) => "resolution",
            TaskError::Infrastructure { .. } => "infrastructure",
            TaskError::Timeout { .. } => "timeout",
            TaskError::NodeLevel(_) => "node_level",
            TaskError::PostProcessing(_) => "post_processing",
            TaskError::Io(_) => "io",
        }
    }

    pub fn returncode(&self) -> Option<i32> {
        match self {
            TaskError::Infrastructure { returncode, .. } => *returncode,
            _ => None,
        }
    }

    pub fn stdout(&self) -> Option<&str> {
        match self {
            TaskError::Infrastructure { stdout, .. } | TaskError::Timeout { stdout, .. } => {
                Some(stdout)
            }
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            TaskError::Infrastructure { stderr, .. } | TaskError::Timeout { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }
}

impl From<RunError> for TaskError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::TimedOut {
                timeout,
                elapsed_ms,
                stdout,
                stderr,
            } => TaskError::Timeout {
                timeout_secs: timeout.as_secs_f64(),
                elapsed_ms,
                stdout,
                stderr,
            },
            other => TaskError::Infrastructure {
                message: other.to_string(),
                returncode: None,
                stdout: String::new(),
                stderr: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_run_error_maps_to_timeout_task_error() {
        let err: TaskError = RunError::TimedOut {
            timeout: Duration::from_secs(2),
            elapsed_ms: 2010,
            stdout: "partial".to_string(),
            stderr: String::new(),
        }
        .into();

        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.stdout(), Some("partial"));
        assert!(err.to_string().contains("timed out after 2s"));
    }

    #[test]
    fn spawn_run_error_maps_to_infrastructure() {
        let err: TaskError = RunError::Spawn {
            program: "/missing/hython".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        }
        .into();

        assert_eq!(err.kind(), "infrastructure");
        assert!(err.to_string().contains("/missing/hython"));
        assert_eq!(err.returncode(), None);
    }
}
