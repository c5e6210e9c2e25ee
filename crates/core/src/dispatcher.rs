//! Routes a `/cook` body to its processor and records successful runs in the
//! caller's operation stack.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::layout;
use crate::log_store::{LogContext, UserStackStore};
use crate::processor::TaskResponse;
use crate::registry::TaskRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Unsupported task type or failed validation; nothing ran.
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub disposition: Disposition,
    pub body: Value,
}

impl Dispatched {
    fn rejected(body: Value) -> Self {
        Self {
            disposition: Disposition::Rejected,
            body,
        }
    }

    fn failed(error: String, traceback: String) -> Self {
        Self {
            disposition: Disposition::Failed,
            body: json!({"ok": false, "error": error, "traceback": traceback}),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    user_stacks: UserStackStore,
}

impl Dispatcher {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            user_stacks: UserStackStore::new(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub async fn handle_cook(&self, body: Value) -> Dispatched {
        let task_type = body
            .get("task_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(self.registry.default_task_type())
            .to_string();

        let Some(processor) = self.registry.lookup(&task_type) else {
            warn!(%task_type, "unsupported task_type");
            return Dispatched::rejected(json!({
                "ok": false,
                "error": "unsupported task_type",
                "task_type": task_type,
                "supported_tasks": self.registry.list_supported(),
            }));
        };

        let request = match processor.validate(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(%task_type, error = %e, "request rejected");
                return Dispatched::rejected(json!({"ok": false, "error": e.to_string()}));
            }
        };

        let request_time = request.request_time().cloned();
        let user_ctx = request.user_id().map(|user_id| {
            LogContext::new(
                layout::base_dir(Path::new(&request.hip)),
                request.uuid(),
                Some(user_id.to_string()),
            )
        });

        info!(%task_type, uuid = %request.uuid(), user_id = ?request.user_id(), "dispatching task");
        let executed =
            tokio::task::spawn_blocking(move || processor.execute(request, &body)).await;

        let response: TaskResponse = match executed {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(%task_type, error = %format!("{e:#}"), "processor error");
                return Dispatched::failed(e.to_string(), format!("{e:?}"));
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                warn!(%task_type, error = %message, "processor panicked");
                return Dispatched::failed(
                    message.clone(),
                    format!("processor for {task_type} panicked: {message}"),
                );
            }
        };

        if !response.ok {
            return Dispatched {
                disposition: Disposition::Failed,
                body: response.body,
            };
        }

        if let (Some(ctx), Some(request_time)) = (user_ctx, request_time) {
            if let Err(e) = self
                .user_stacks
                .record_completion(&ctx, &task_type, request_time)
                .await
            {
                warn!(uuid = %ctx.uuid, error = %format!("{e:#}"), "failed to update user stack log");
            }
        }

        Dispatched {
            disposition: Disposition::Completed,
            body: response.body,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TaskProcessor;
    use crate::request::{JobRequest, UserStackLogRecord};
    use anyhow::anyhow;
    use std::fs;
    use tempfile::tempdir;

    enum Behaviour {
        Succeed,
        Fail,
        Error,
        Panic,
    }

    struct FakeProcessor {
        task_type: &'static str,
        behaviour: Behaviour,
    }

    impl TaskProcessor for FakeProcessor {
        fn task_type(&self) -> &str {
            self.task_type
        }

        fn required_fields(&self) -> &[&'static str] {
            &["hip"]
        }

        fn execute(&self, request: JobRequest, _raw: &Value) -> anyhow::Result<TaskResponse> {
            match self.behaviour {
                Behaviour::Succeed => Ok(TaskResponse {
                    ok: true,
                    body: json!({"ok": true, "uuid": request.uuid()}),
                }),
                Behaviour::Fail => Ok(TaskResponse {
                    ok: false,
                    body: json!({"ok": false, "error": "worker exited with code 1"}),
                }),
                Behaviour::Error => Err(anyhow!("disk vanished")),
                Behaviour::Panic => panic!("engine state corrupted"),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = TaskRegistry::new("room_generation");
        for (task_type, behaviour) in [
            ("room_generation", Behaviour::Succeed),
            ("failing", Behaviour::Fail),
            ("erroring", Behaviour::Error),
            ("panicking", Behaviour::Panic),
        ] {
            registry.register(Arc::new(FakeProcessor {
                task_type,
                behaviour,
            }));
        }
        Dispatcher::new(registry)
    }

    fn user_log(base: &Path, user: &str) -> Option<UserStackLogRecord> {
        let raw = fs::read(layout::user_log_path(base, user)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    #[tokio::test]
    async fn unsupported_task_type_lists_supported_tasks() {
        let out = dispatcher()
            .handle_cook(json!({"task_type": "teleport", "hip": "/p/a.hip", "uuid": "U1"}))
            .await;

        assert_eq!(out.disposition, Disposition::Rejected);
        assert_eq!(out.body["error"], "unsupported task_type");
        assert_eq!(
            out.body["supported_tasks"],
            json!(["erroring", "failing", "panicking", "room_generation"])
        );
    }

    #[tokio::test]
    async fn missing_task_type_uses_default() {
        let dir = tempdir().expect("tempdir");
        let hip = dir.path().join("a.hip");
        let out = dispatcher()
            .handle_cook(json!({"hip": hip.to_string_lossy(), "uuid": "U1"}))
            .await;
        assert_eq!(out.disposition, Disposition::Completed);
        assert_eq!(out.body["uuid"], "U1");
    }

    #[tokio::test]
    async fn validation_failure_is_rejected() {
        let out = dispatcher()
            .handle_cook(json!({"task_type": "room_generation", "uuid": "U1"}))
            .await;
        assert_eq!(out.disposition, Disposition::Rejected);
        assert_eq!(out.body["error"], "missing required field: hip");
    }

    #[tokio::test]
    async fn processor_errors_and_panics_become_failure_bodies() {
        let dispatcher = dispatcher();

        let out = dispatcher
            .handle_cook(json!({"task_type": "erroring", "hip": "/p/a.hip", "uuid": "U1"}))
            .await;
        assert_eq!(out.disposition, Disposition::Failed);
        assert_eq!(out.body["error"], "disk vanished");
        assert!(out.body["traceback"].is_string());

        let out = dispatcher
            .handle_cook(json!({"task_type": "panicking", "hip": "/p/a.hip", "uuid": "U2"}))
            .await;
        assert_eq!(out.disposition, Disposition::Failed);
        assert_eq!(out.body["error"], "engine state corrupted");
    }

    #[tokio::test]
    async fn user_stack_is_updated_only_on_success_with_user_and_time() {
        let dir = tempdir().expect("tempdir");
        let hip = dir.path().join("a.hip").to_string_lossy().into_owned();
        let dispatcher = dispatcher();

        dispatcher
            .handle_cook(json!({"task_type": "failing", "hip": hip, "uuid": "U0",
                "user_id": "alice", "request_time": "2026-10-16T08:00:00Z"}))
            .await;
        assert!(user_log(dir.path(), "alice").is_none());

        dispatcher
            .handle_cook(json!({"hip": hip, "uuid": "U1", "user_id": "alice"}))
            .await;
        assert!(user_log(dir.path(), "alice").is_none());

        for uuid in ["U2", "U3"] {
            let out = dispatcher
                .handle_cook(json!({"hip": hip, "uuid": uuid,
                    "user_id": "alice", "request_time": "2026-10-16T09:00:00Z"}))
                .await;
            assert_eq!(out.disposition, Disposition::Completed);
        }

        let record = user_log(dir.path(), "alice").expect("user log written");
        assert_eq!(record.stack.len(), 1);
        assert_eq!(record.stack[0].uuid, "U3");
        assert_eq!(record.stack[0].process_name, "room_generation");
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].status, "replaced");
    }
}
