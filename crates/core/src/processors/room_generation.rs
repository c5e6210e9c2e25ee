use std::path::Path;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info_span};

use crate::config::{AppConfig, EngineConfig};
use crate::convert;
use crate::error::TaskError;
use crate::layout;
use crate::processor::{TaskProcessor, TaskResponse};
use crate::request::JobRequest;

use super::common::{self, Stages, TaskRun};

pub const TASK_TYPE: &str = "room_generation";
const REQUIRED_FIELDS: &[&str] = &["hip", "cook_node", "uuid"];

/// Cooks the room node with the request's parameters, then rasterizes the
/// pixel file the cook exported.
pub struct RoomGenerationProcessor {
    engine: EngineConfig,
    fail_on_node_errors: bool,
}

impl RoomGenerationProcessor {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            fail_on_node_errors: config.tasks.fail_on_node_errors,
        }
    }

    fn cook(&self, request: &JobRequest, stages: &mut Stages) -> Result<(), TaskError> {
        let executable = common::resolve_worker_executable(request, &self.engine)?;
        let script = common::resolve_script(self.engine.worker_script.as_deref())?;

        let job = json!({
            "hip": request.hip,
            "cook_node": request.cook_node,
            "parm_node": request.parm_node(),
            "parms": common::normalize_parms(request.parms.as_ref()),
            "uuid": request.uuid(),
            "mode": "cook",
        });
        debug!(executable = %executable.display(), "starting cook worker");

        let execution = stages.execution.insert(common::run_worker(
            &executable,
            script.as_deref(),
            &job,
            request.timeout(),
            &self.engine,
        )?);
        common::check_execution(execution, self.fail_on_node_errors)?;

        let base = layout::base_dir(Path::new(&request.hip));
        let uuid = request.uuid().to_string();
        let wait = request.post_wait();
        stages.post = Some(common::run_bounded_stage(
            "json2png",
            request.post_timeout(),
            move |gate| {
                let report = convert::json_to_png(&base, &uuid, wait, gate);
                let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
                (report.ok, payload, report.error)
            },
        ));
        Ok(())
    }
}

impl TaskProcessor for RoomGenerationProcessor {
    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn required_fields(&self) -> &[&'static str] {
        REQUIRED_FIELDS
    }

    fn execute(&self, request: JobRequest, raw: &Value) -> Result<TaskResponse> {
        let span = info_span!("room_generation", uuid = %request.uuid());
        let _enter = span.enter();

        let mut run = TaskRun::new(TASK_TYPE, request, raw);
        let result = self.cook(&run.request, &mut run.stages);
        run.finish(result);
        run.write_detail_log();
        Ok(run.into_response())
    }
}
