//! Building blocks shared by the task processors.
//!
//! Each processor composes these explicitly: validate, resolve the engine,
//! write a job descriptor, run the worker, classify its report, run any
//! bounded file stage, then record the detail log and shape the response.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tempfile::{Builder, TempPath};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::layout;
use crate::log_store::{now_rfc3339, CommitGate, LogContext};
use crate::process::run_external;
use crate::processor::TaskResponse;
use crate::request::{
    DetailLogRecord, ExecutionResult, JobRequest, NormalizedRequest, PostProcessResult,
    WorkerReport,
};

pub const ENV_HFS: &str = "HFS";

#[cfg(windows)]
const ENGINE_EXECUTABLE: &str = "hython.exe";
#[cfg(not(windows))]
const ENGINE_EXECUTABLE: &str = "hython";

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Checks `fields` in order, then `uuid`, then decodes the body.
pub fn validate_required(body: &Value, fields: &[&str]) -> Result<JobRequest, TaskError> {
    let object = body.as_object().ok_or_else(|| {
        TaskError::Validation("request body must be a JSON object".to_string())
    })?;

    for field in fields.iter().copied().chain(["uuid"]) {
        if is_blank(object.get(field)) {
            return Err(TaskError::Validation(format!(
                "missing required field: {field}"
            )));
        }
    }

    JobRequest::from_body(body)
}

/// Lower-cases parameter names; values pass through untouched.
pub fn normalize_parms(parms: Option<&Map<String, Value>>) -> Map<String, Value> {
    parms
        .into_iter()
        .flatten()
        .map(|(name, value)| (name.to_lowercase(), value.clone()))
        .collect()
}

pub fn normalized_request(task_type: &str, request: &JobRequest) -> NormalizedRequest {
    NormalizedRequest {
        task_type: task_type.to_string(),
        hip: request.hip.clone(),
        cook_node: request.cook_node.clone(),
        parm_node: request.parm_node().to_string(),
        parms: normalize_parms(request.parms.as_ref()),
    }
}

pub fn resolve_worker_executable(
    request: &JobRequest,
    engine: &EngineConfig,
) -> Result<PathBuf, TaskError> {
    resolve_worker_executable_with(request, engine, env::var_os(ENV_HFS))
}

/// Explicit `hython` wins, then the request's `hfs`, then `HFS` from the
/// environment, then the configured install.
pub fn resolve_worker_executable_with(
    request: &JobRequest,
    engine: &EngineConfig,
    env_hfs: Option<OsString>,
) -> Result<PathBuf, TaskError> {
    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };

    let executable = if let Some(explicit) = non_blank(&request.hython) {
        explicit
    } else {
        let base = non_blank(&request.hfs)
            .or_else(|| env_hfs.filter(|v| !v.is_empty()).map(PathBuf::from))
            .or_else(|| engine.hfs.clone())
            .ok_or_else(|| {
                TaskError::Resolution(
                    "no engine executable: request has neither 'hython' nor 'hfs' and HFS is not set"
                        .to_string(),
                )
            })?;
        base.join("bin").join(ENGINE_EXECUTABLE)
    };

    if !executable.is_file() {
        return Err(TaskError::Resolution(format!(
            "engine executable not found: {}",
            executable.display()
        )));
    }
    Ok(executable)
}

/// A configured worker script must exist; an unset one means the engine
/// executable is invoked directly.
pub fn resolve_script(script: Option<&Path>) -> Result<Option<PathBuf>, TaskError> {
    match script {
        None => Ok(None),
        Some(path) if path.is_file() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(TaskError::Resolution(format!(
            "worker script not found: {}",
            path.display()
        ))),
    }
}

pub fn worker_command(
    executable: &Path,
    script: Option<&Path>,
    job: &Path,
    out: &Path,
) -> Vec<OsString> {
    let mut cmd = vec![executable.as_os_str().to_os_string()];
    if let Some(script) = script {
        cmd.push(script.as_os_str().to_os_string());
    }
    cmd.extend([
        OsString::from("--job"),
        job.as_os_str().to_os_string(),
        OsString::from("--out"),
        out.as_os_str().to_os_string(),
    ]);
    cmd
}

pub fn child_env(engine: &EngineConfig) -> Vec<(String, String)> {
    vec![(
        "PYTHONIOENCODING".to_string(),
        engine.python_io_encoding.clone(),
    )]
}

fn temp_json(prefix: &str) -> Result<(fs::File, TempPath), TaskError> {
    let file = Builder::new().prefix(prefix).suffix(".json").tempfile()?;
    let (file, path) = file.into_parts();
    Ok((file, path))
}

/// Writes the job descriptor to a temp file that is removed when the
/// returned path is dropped.
pub fn write_job_descriptor(job: &Value) -> Result<TempPath, TaskError> {
    let (mut file, path) = temp_json("roomcook-job-")?;
    let encoded = serde_json::to_vec(job).map_err(std::io::Error::from)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    Ok(path)
}

/// Whole stdout as one object, else the last line that is an object, else
/// the `--out` file.
pub fn parse_worker_output(stdout: &str, out_file: &Path) -> Option<Value> {
    let as_object = |text: &str| {
        serde_json::from_str::<Value>(text.trim())
            .ok()
            .filter(Value::is_object)
    };

    if let Some(value) = as_object(stdout) {
        return Some(value);
    }
    if let Some(value) = stdout.lines().rev().find_map(as_object) {
        return Some(value);
    }

    let fallback = fs::read_to_string(out_file).ok()?;
    as_object(&fallback)
}

/// Runs one worker invocation. A non-zero exit is still `Ok`; see
/// [`check_execution`].
pub fn run_worker(
    executable: &Path,
    script: Option<&Path>,
    job: &Value,
    timeout: Duration,
    engine: &EngineConfig,
) -> Result<ExecutionResult, TaskError> {
    let job_path = write_job_descriptor(job)?;
    let (_, out_path) = temp_json("roomcook-out-")?;

    let cmd = worker_command(executable, script, &job_path, &out_path);
    let output = run_external(&cmd, timeout, &child_env(engine))?;

    let worker_json = parse_worker_output(&output.stdout, &out_path);
    let report = worker_json
        .clone()
        .and_then(|value| serde_json::from_value::<WorkerReport>(value).ok());

    debug!(
        returncode = ?output.returncode,
        elapsed_ms = output.elapsed_ms,
        parsed = report.is_some(),
        "worker finished"
    );

    Ok(ExecutionResult {
        returncode: output.returncode,
        stdout: output.stdout,
        stderr: output.stderr,
        elapsed_ms: output.elapsed_ms,
        worker_json,
        report,
    })
}

/// Decides whether a finished worker run counts as a success.
pub fn check_execution(
    execution: &ExecutionResult,
    fail_on_node_errors: bool,
) -> Result<(), TaskError> {
    let infrastructure = |message: String| TaskError::Infrastructure {
        message,
        returncode: execution.returncode,
        stdout: execution.stdout.clone(),
        stderr: execution.stderr.clone(),
    };
    let worker_error = execution
        .report
        .as_ref()
        .and_then(WorkerReport::error_message)
        .map(|msg| format!(": {msg}"))
        .unwrap_or_default();

    if execution.returncode != Some(0) {
        let code = execution
            .returncode
            .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
        return Err(infrastructure(format!("worker exited with {code}{worker_error}")));
    }

    let Some(report) = execution.report.as_ref() else {
        return Err(infrastructure(
            "worker produced no parsable JSON result".to_string(),
        ));
    };
    if !report.ok {
        return Err(infrastructure(format!("worker reported failure{worker_error}")));
    }

    if report.has_node_level_errors() {
        warn!(
            node_errors = report.node_errors.len(),
            missing_parms = ?report.missing_parms,
            "worker reported node-level problems"
        );
        if fail_on_node_errors {
            return Err(TaskError::NodeLevel(format!(
                "node reported {} error(s) and {} missing parameter(s)",
                report.node_errors.len(),
                report.missing_parms.len()
            )));
        }
    }
    Ok(())
}

/// Runs a file stage on its own thread and stops waiting after `timeout`.
///
/// The closure yields `(ok, payload, error)` and must write its artifacts
/// through the gate it is handed. On timeout the gate is closed before the
/// timeout is reported, so a stage reported as failed leaves nothing new on
/// disk. A result that raced in while closing is still used.
pub fn run_bounded_stage<F>(label: &str, timeout: Duration, stage: F) -> PostProcessResult
where
    F: FnOnce(&CommitGate) -> (bool, Value, Option<String>) + Send + 'static,
{
    let started = Instant::now();
    let gate = CommitGate::open();
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("roomcook-{label}"))
        .spawn({
            let gate = gate.clone();
            move || {
                let _ = tx.send(stage(&gate));
            }
        });

    let failed = |stderr: String| PostProcessResult {
        ok: false,
        returncode: None,
        elapsed_ms_post: started.elapsed().as_millis() as u64,
        stderr,
        json: None,
    };
    let finished = |(ok, payload, error): (bool, Value, Option<String>)| PostProcessResult {
        ok,
        returncode: Some(if ok { 0 } else { 1 }),
        elapsed_ms_post: started.elapsed().as_millis() as u64,
        stderr: error.unwrap_or_default(),
        json: Some(payload),
    };

    if let Err(e) = spawned {
        return failed(format!("failed to start {label}: {e}"));
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => finished(outcome),
        Err(RecvTimeoutError::Timeout) => {
            gate.close();
            if let Ok(outcome) = rx.try_recv() {
                return finished(outcome);
            }
            warn!(label, timeout_secs = timeout.as_secs_f64(), "stage timed out");
            failed(format!(
                "{label} timed out after {:.1}s",
                timeout.as_secs_f64()
            ))
        }
        Err(RecvTimeoutError::Disconnected) => failed(format!("{label} aborted unexpectedly")),
    }
}

/// Accumulated stage outputs of one request.
#[derive(Debug, Default)]
pub struct Stages {
    pub execution: Option<ExecutionResult>,
    pub post: Option<PostProcessResult>,
}

/// One request past validation: collects stage results, writes the detail
/// log and shapes the response.
#[derive(Debug)]
pub struct TaskRun {
    pub task_type: String,
    pub request: JobRequest,
    pub raw: Value,
    pub stages: Stages,
    pub error: Option<TaskError>,
    started: Instant,
}

impl TaskRun {
    pub fn new(task_type: &str, request: JobRequest, raw: &Value) -> Self {
        Self {
            task_type: task_type.to_string(),
            request,
            raw: raw.clone(),
            stages: Stages::default(),
            error: None,
            started: Instant::now(),
        }
    }

    pub fn finish(&mut self, result: Result<(), TaskError>) {
        if let Err(e) = result {
            warn!(
                uuid = %self.request.uuid(),
                task_type = %self.task_type,
                kind = e.kind(),
                error = %e,
                "task failed"
            );
            self.error = Some(e);
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
            && self
                .stages
                .execution
                .as_ref()
                .is_some_and(ExecutionResult::worker_ok)
    }

    pub fn base_dir(&self) -> PathBuf {
        layout::base_dir(Path::new(&self.request.hip))
    }

    fn elapsed_ms_dispatch(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn returncode(&self) -> Option<i32> {
        self.stages
            .execution
            .as_ref()
            .map(|e| e.returncode)
            .unwrap_or_else(|| self.error.as_ref().and_then(TaskError::returncode))
    }

    fn stream(
        &self,
        pick: fn(&ExecutionResult) -> &str,
        fallback: fn(&TaskError) -> Option<&str>,
    ) -> String {
        self.stages
            .execution
            .as_ref()
            .map(pick)
            .or_else(|| self.error.as_ref().and_then(fallback))
            .unwrap_or_default()
            .to_string()
    }

    fn stdout(&self) -> String {
        self.stream(|e| e.stdout.as_str(), TaskError::stdout)
    }

    fn stderr(&self) -> String {
        self.stream(|e| e.stderr.as_str(), TaskError::stderr)
    }

    fn worker_json(&self) -> Option<Value> {
        self.stages
            .execution
            .as_ref()
            .and_then(|e| e.worker_json.clone())
    }

    pub fn detail_record(&self) -> DetailLogRecord {
        DetailLogRecord {
            uuid: self.request.uuid().to_string(),
            task_type: self.task_type.clone(),
            ok: self.ok(),
            elapsed_ms_dispatch: self.elapsed_ms_dispatch(),
            returncode: self.returncode(),
            stdout: self.stdout(),
            stderr: self.stderr(),
            worker_json: self.worker_json(),
            execution: self.stages.execution.clone(),
            post: self.stages.post.clone(),
            error: self.error.as_ref().map(ToString::to_string),
            error_kind: self.error.as_ref().map(|e| e.kind().to_string()),
            request: normalized_request(&self.task_type, &self.request),
            request_raw: self.raw.clone(),
            written_at: now_rfc3339(),
        }
    }

    /// A failed log write is reported but never changes the response.
    pub fn write_detail_log(&self) {
        let ctx = LogContext::new(
            self.base_dir(),
            self.request.uuid(),
            self.request.user_id().map(str::to_string),
        );
        if let Err(e) = ctx.write_detail(&self.detail_record()) {
            warn!(uuid = %ctx.uuid, error = %format!("{e:#}"), "failed to write detail log");
        }
    }

    pub fn into_response(self) -> TaskResponse {
        let ok = self.ok();
        let elapsed_ms_dispatch = self.elapsed_ms_dispatch();
        let post = self
            .stages
            .post
            .as_ref()
            .and_then(|p| serde_json::to_value(p).ok())
            .unwrap_or(Value::Null);

        if ok {
            let mut body = match self.worker_json() {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            body.insert("ok".to_string(), Value::Bool(true));
            body.insert("elapsed_ms_dispatch".to_string(), json!(elapsed_ms_dispatch));
            body.insert("post".to_string(), post);
            info!(
                uuid = %self.request.uuid(),
                task_type = %self.task_type,
                elapsed_ms = elapsed_ms_dispatch,
                "task completed"
            );
            return TaskResponse {
                ok,
                body: Value::Object(body),
            };
        }

        let error = self
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "task failed".to_string());
        let body = json!({
            "ok": false,
            "error": error,
            "error_kind": self.error.as_ref().map(TaskError::kind),
            "elapsed_ms_dispatch": elapsed_ms_dispatch,
            "returncode": self.returncode(),
            "stdout": self.stdout(),
            "stderr": self.stderr(),
            "worker_json": self.worker_json(),
            "post": post,
        });
        TaskResponse { ok, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(value: Value) -> JobRequest {
        JobRequest::from_body(&value).expect("decode request")
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"").expect("touch");
    }

    #[test]
    fn normalize_parms_lowercases_keys_only() {
        let parms = json!({"AREA_Layout_Seed": 9624, "Json_Data": "{\"A\":1}"});
        let normalized = normalize_parms(parms.as_object());
        assert_eq!(
            Value::Object(normalized),
            json!({"area_layout_seed": 9624, "json_data": "{\"A\":1}"})
        );
        assert!(normalize_parms(None).is_empty());
    }

    #[test]
    fn validation_reports_first_missing_field_in_order() {
        let err = validate_required(&json!({"cook_node": "/obj/x"}), &["hip", "cook_node"])
            .expect_err("hip missing");
        assert_eq!(err.to_string(), "missing required field: hip");

        let err = validate_required(
            &json!({"hip": "/p/a.hip", "cook_node": "/obj/x", "uuid": "  "}),
            &["hip", "cook_node"],
        )
        .expect_err("blank uuid");
        assert_eq!(err.to_string(), "missing required field: uuid");
    }

    #[test]
    fn explicit_executable_beats_base_install_hint() {
        let dir = tempdir().expect("tempdir");
        let explicit = dir.path().join("custom/hython");
        touch(&explicit);
        touch(&dir.path().join("hfs/bin").join(ENGINE_EXECUTABLE));

        let req = request(json!({
            "hython": explicit.to_string_lossy(),
            "hfs": dir.path().join("hfs").to_string_lossy(),
        }));
        let resolved = resolve_worker_executable_with(&req, &EngineConfig::default(), None)
            .expect("resolve");
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn base_install_precedence_is_request_then_env_then_config() {
        let dir = tempdir().expect("tempdir");
        for name in ["req", "env", "cfg"] {
            touch(&dir.path().join(name).join("bin").join(ENGINE_EXECUTABLE));
        }
        let engine = EngineConfig {
            hfs: Some(dir.path().join("cfg")),
            ..EngineConfig::default()
        };
        let env_hfs = Some(dir.path().join("env").into_os_string());

        let with_hint = request(json!({"hfs": dir.path().join("req").to_string_lossy()}));
        let resolved =
            resolve_worker_executable_with(&with_hint, &engine, env_hfs.clone()).expect("req");
        assert!(resolved.starts_with(dir.path().join("req")));

        let bare = request(json!({}));
        let resolved = resolve_worker_executable_with(&bare, &engine, env_hfs).expect("env");
        assert!(resolved.starts_with(dir.path().join("env")));

        let resolved = resolve_worker_executable_with(&bare, &engine, None).expect("cfg");
        assert!(resolved.starts_with(dir.path().join("cfg")));
    }

    #[test]
    fn unresolvable_executable_is_a_resolution_error() {
        let err = resolve_worker_executable_with(&request(json!({})), &EngineConfig::default(), None)
            .expect_err("nothing to resolve");
        assert_eq!(err.kind(), "resolution");

        let err = resolve_worker_executable_with(
            &request(json!({"hython": "/no/such/hython"})),
            &EngineConfig::default(),
            None,
        )
        .expect_err("missing file");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn worker_command_places_script_before_job_arguments() {
        let cmd = worker_command(
            Path::new("/hfs/bin/hython"),
            Some(Path::new("/w/cook.py")),
            Path::new("/tmp/job.json"),
            Path::new("/tmp/out.json"),
        );
        let cmd: Vec<_> = cmd.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            cmd,
            ["/hfs/bin/hython", "/w/cook.py", "--job", "/tmp/job.json", "--out", "/tmp/out.json"]
        );
    }

    #[test]
    fn worker_output_falls_back_to_last_json_line_then_out_file() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("out.json");

        let noisy = "Loading hip...\n{\"ok\": true, \"elapsed_ms\": 3}\n";
        assert_eq!(parse_worker_output(noisy, &out), Some(json!({"ok": true, "elapsed_ms": 3})));

        assert_eq!(parse_worker_output("no json here", &out), None);
        fs::write(&out, "{\"ok\": false, \"error\": \"boom\"}").expect("write out");
        assert_eq!(
            parse_worker_output("no json here", &out),
            Some(json!({"ok": false, "error": "boom"}))
        );
    }

    fn execution(returncode: Option<i32>, worker: Value) -> ExecutionResult {
        ExecutionResult {
            returncode,
            stdout: worker.to_string(),
            stderr: String::new(),
            elapsed_ms: 1,
            report: serde_json::from_value(worker.clone()).ok(),
            worker_json: Some(worker),
        }
    }

    #[test]
    fn non_zero_exit_is_infrastructure_failure_with_worker_message() {
        let exec = execution(Some(1), json!({"ok": false, "error": "cook_node not found"}));
        let err = check_execution(&exec, false).expect_err("exit 1");
        assert_eq!(err.kind(), "infrastructure");
        assert_eq!(err.returncode(), Some(1));
        assert!(err.to_string().contains("cook_node not found"));
    }

    #[test]
    fn node_errors_only_fail_when_configured() {
        let exec = execution(Some(0), json!({"ok": true, "node_errors": ["bad"], "missing_parms": []}));
        assert!(check_execution(&exec, false).is_ok());
        let err = check_execution(&exec, true).expect_err("policy enabled");
        assert_eq!(err.kind(), "node_level");
    }

    #[test]
    fn bounded_stage_reports_timeout_without_waiting_for_the_thread() {
        let started = Instant::now();
        let result = run_bounded_stage("slow", Duration::from_millis(100), |_| {
            thread::sleep(Duration::from_secs(2));
            (true, Value::Null, None)
        });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!result.ok);
        assert!(result.returncode.is_none());
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn timed_out_stage_cannot_write_its_artifact_later() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("export/serve/U7.png");
        let result = run_bounded_stage("json2png", Duration::from_millis(50), {
            let artifact = artifact.clone();
            move |gate| {
                thread::sleep(Duration::from_millis(300));
                match gate.commit(&artifact, b"late raster") {
                    Ok(()) => (true, Value::Null, None),
                    Err(e) => (false, Value::Null, Some(format!("{e:#}"))),
                }
            }
        });
        assert!(!result.ok);
        assert!(result.stderr.contains("timed out"));

        thread::sleep(Duration::from_millis(600));
        assert!(!artifact.exists(), "stage reported as timed out must not leave an artifact");
    }

    #[test]
    fn stage_within_deadline_commits_through_the_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("out.json");
        let result = run_bounded_stage("png2json", Duration::from_secs(5), {
            let artifact = artifact.clone();
            move |gate| match gate.commit_json(&artifact, &json!({"0": [1.0, 0.0, 0.0]})) {
                Ok(()) => (true, json!({"ok": true}), None),
                Err(e) => (false, Value::Null, Some(format!("{e:#}"))),
            }
        });
        assert!(result.ok, "unexpected error: {}", result.stderr);
        assert_eq!(result.returncode, Some(0));
        assert!(artifact.is_file());
    }

    #[test]
    fn failed_run_without_execution_still_shapes_a_response() {
        let req = request(json!({"hip": "/p/room.hip", "cook_node": "/obj/x", "uuid": "U9"}));
        let raw = json!({"hip": "/p/room.hip", "cook_node": "/obj/x", "uuid": "U9"});
        let mut run = TaskRun::new("room_generation", req, &raw);
        run.finish(Err(TaskError::Resolution("engine executable not found: x".to_string())));

        let record = run.detail_record();
        assert!(!record.ok);
        assert_eq!(record.error_kind.as_deref(), Some("resolution"));
        assert_eq!(record.request_raw, raw);

        let response = run.into_response();
        assert!(!response.ok);
        assert_eq!(response.body["ok"], false);
        assert_eq!(response.body["error_kind"], "resolution");
        assert!(response.body["worker_json"].is_null());
    }
}
