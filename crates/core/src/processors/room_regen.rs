use std::path::Path;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info_span};

use crate::config::{AppConfig, EngineConfig};
use crate::convert::{self, PixelJsonFormat};
use crate::error::TaskError;
use crate::layout;
use crate::processor::{TaskProcessor, TaskResponse};
use crate::request::JobRequest;

use super::common::{self, Stages, TaskRun};

pub const TASK_TYPE: &str = "room_regen";
const REQUIRED_FIELDS: &[&str] = &["hip", "cook_node", "uuid"];
const PRESS_BUTTON: &str = "execute";

/// Rebuilds a room from an edited raster: the uploaded
/// `export/serve/<uuid>.png` is turned back into the pixel file, then the
/// cook node's `execute` button is pressed so the engine re-imports it.
pub struct RoomRegenProcessor {
    engine: EngineConfig,
    fail_on_node_errors: bool,
}

impl RoomRegenProcessor {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            fail_on_node_errors: config.tasks.fail_on_node_errors,
        }
    }

    fn regen(&self, request: &JobRequest, stages: &mut Stages) -> Result<(), TaskError> {
        let executable = common::resolve_worker_executable(request, &self.engine)?;
        let script = common::resolve_script(
            self.engine
                .press_script
                .as_deref()
                .or(self.engine.worker_script.as_deref()),
        )?;

        let base = layout::base_dir(Path::new(&request.hip));
        let raster = layout::raster_path(&base, request.uuid());
        let pixel_json = layout::pixel_json_path(&base, request.uuid());

        let pre = stages.post.insert(common::run_bounded_stage(
            "png2json",
            request.post_timeout(),
            {
                let (raster, pixel_json) = (raster.clone(), pixel_json.clone());
                move |gate| match convert::png_to_json(
                    &raster,
                    Some(pixel_json.as_path()),
                    PixelJsonFormat::Metadata,
                    gate,
                ) {
                    Ok(export) => (
                        true,
                        json!({
                            "ok": true,
                            "path_png": raster.display().to_string(),
                            "path_json": export.output.display().to_string(),
                            "width": export.width,
                            "height": export.height,
                            "pixels_written": export.pixel_count,
                        }),
                        None,
                    ),
                    Err(e) => {
                        let error = format!("{e:#}");
                        (
                            false,
                            json!({
                                "ok": false,
                                "path_png": raster.display().to_string(),
                                "exists": raster.is_file(),
                                "error": error,
                            }),
                            Some(error),
                        )
                    }
                }
            },
        ));
        if !pre.ok {
            return Err(TaskError::PostProcessing(pre.stderr.clone()));
        }

        let job = json!({
            "hip": request.hip,
            "cook_node": request.cook_node,
            "parm_node": request.parm_node(),
            "parms": common::normalize_parms(request.parms.as_ref()),
            "uuid": request.uuid(),
            "mode": "press_button",
            "button": PRESS_BUTTON,
            "pixel_json": pixel_json.display().to_string(),
        });
        debug!(executable = %executable.display(), "starting press worker");

        let execution = stages.execution.insert(common::run_worker(
            &executable,
            script.as_deref(),
            &job,
            request.timeout(),
            &self.engine,
        )?);
        common::check_execution(execution, self.fail_on_node_errors)
    }
}

impl TaskProcessor for RoomRegenProcessor {
    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn required_fields(&self) -> &[&'static str] {
        REQUIRED_FIELDS
    }

    fn execute(&self, request: JobRequest, raw: &Value) -> Result<TaskResponse> {
        let span = info_span!("room_regen", uuid = %request.uuid());
        let _enter = span.enter();

        let mut run = TaskRun::new(TASK_TYPE, request, raw);
        let result = self.regen(&run.request, &mut run.stages);
        run.finish(result);
        run.write_detail_log();
        Ok(run.into_response())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::convert::encode_png;
    use crate::log_store::write_atomic;
    use crate::request::DetailLogRecord;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::tempdir;

    const PRESS_OK: &str = r#"cp "$2" '{base}/job_copy.json'
echo '{"ok": true, "elapsed_ms": 4, "has_errors": false}'
"#;

    fn setup(worker_body: &str) -> (tempfile::TempDir, RoomRegenProcessor, Value) {
        let dir = tempdir().expect("tempdir");
        let hip = dir.path().join("room.hip");
        fs::write(&hip, b"").expect("write hip");
        let script = dir.path().join("press.sh");
        fs::write(
            &script,
            worker_body.replace("{base}", &dir.path().to_string_lossy()),
        )
        .expect("write press worker");

        let mut config = AppConfig::default();
        config.engine.press_script = Some(script);
        let processor = RoomRegenProcessor::new(&config);

        let body = json!({
            "task_type": "room_regen",
            "hip": hip.to_string_lossy(),
            "cook_node": "/obj/geo1/IMPORT",
            "uuid": "R1",
            "hython": "/bin/sh",
        });
        (dir, processor, body)
    }

    fn upload(base: &Path, uuid: &str) {
        let raster = RgbImage::from_pixel(4, 4, Rgb([0, 128, 255]));
        write_atomic(
            &layout::raster_path(base, uuid),
            &encode_png(&raster).expect("encode png"),
        )
        .expect("write png");
    }

    #[test]
    fn uploaded_raster_is_converted_then_button_pressed() {
        let (dir, processor, body) = setup(PRESS_OK);
        upload(dir.path(), "R1");

        let request = processor.validate(&body).expect("valid");
        let response = processor.execute(request, &body).expect("execute");
        assert!(response.ok, "unexpected failure: {}", response.body);
        assert_eq!(response.body["post"]["json"]["pixels_written"], 16);

        let pixel_json = layout::pixel_json_path(dir.path(), "R1");
        let doc: Value =
            serde_json::from_slice(&fs::read(&pixel_json).expect("read pixel json")).expect("parse");
        assert_eq!(doc["metadata"]["total_prims"], 16);

        let job: Value =
            serde_json::from_slice(&fs::read(dir.path().join("job_copy.json")).expect("read job"))
                .expect("parse job");
        assert_eq!(job["mode"], "press_button");
        assert_eq!(job["button"], "execute");
        assert_eq!(job["pixel_json"], pixel_json.display().to_string());
    }

    #[test]
    fn missing_upload_aborts_before_the_worker_and_is_logged() {
        let (dir, processor, body) = setup(PRESS_OK);

        let request = processor.validate(&body).expect("valid");
        let response = processor.execute(request, &body).expect("execute");
        assert!(!response.ok);
        assert_eq!(response.body["error_kind"], "post_processing");
        assert_eq!(response.body["post"]["json"]["exists"], false);
        assert!(!dir.path().join("job_copy.json").exists());

        let log: DetailLogRecord = serde_json::from_slice(
            &fs::read(layout::detail_log_path(dir.path(), "R1")).expect("read detail log"),
        )
        .expect("parse detail log");
        assert!(!log.ok);
        assert_eq!(log.request_raw, body);
    }

    #[test]
    fn worker_failure_after_conversion_is_reported() {
        let (dir, processor, body) =
            setup(r#"echo '{"ok": false, "error": "execute button parm not found on cook_node"}'"#);
        upload(dir.path(), "R1");

        let request = processor.validate(&body).expect("valid");
        let response = processor.execute(request, &body).expect("execute");
        assert!(!response.ok);
        assert_eq!(response.body["error_kind"], "infrastructure");
        assert_eq!(response.body["post"]["ok"], true);
    }
}
