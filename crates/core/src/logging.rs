//! Tracing setup plans: which filter each sink gets, where the rolling log
//! file lives, and the panic hook that leaves a crash record behind.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use serde::Serialize;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,worker_stderr=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "roomcook";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Targets that stay quiet on the console but are always kept in the file.
const FILE_DEBUG_TARGETS: [&str; 1] = ["worker_stderr"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_RECORD_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    /// One-shot conversion subcommands.
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug, Serialize)]
struct CrashRecord {
    timestamp_utc: String,
    thread: String,
    location: String,
    payload: String,
    backtrace_policy: String,
    backtrace: String,
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Chains a hook that writes `<data_dir>/logs/crash/panic-*.json` before the
/// previous hook runs. Installing twice is a no-op.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let fallback = |attempted_log_dir, reason| {
        FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir,
            retention_files,
            reason,
        })
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return fallback(
            None,
            "file sink disabled: data_dir is not configured".to_string(),
        );
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return fallback(
            Some(log_dir),
            format!("failed to create log directory: {error}"),
        );
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => fallback(
            Some(log_dir),
            format!("failed to initialize rolling file sink: {error}"),
        ),
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise directives only apply when the filter was implicit.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let implicit = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;
    if !implicit {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    let console_filter = prepend_directives(&options.noise_filter, &user_filter);
    let file_filter = prepend_directives(&file_noise_filter(&options.noise_filter), &user_filter);
    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn prepend_directives(directives: &str, user_filter: &str) -> String {
    if directives.trim().is_empty() {
        user_filter.to_string()
    } else {
        format!("{directives},{user_filter}")
    }
}

/// The file sink keeps worker stderr at debug even when the console
/// silences it.
fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(t, _)| t.trim());
            !FILE_DEBUG_TARGETS.contains(&target)
        })
        .map(str::to_string)
        .collect();
    directives.extend(FILE_DEBUG_TARGETS.iter().map(|t| format!("{t}=debug")));
    directives.join(",")
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_record(crash_dir, &crash_record(info))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash record under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash record under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn crash_record(info: &PanicHookInfo<'_>) -> CrashRecord {
    let backtrace = Backtrace::capture();
    let (backtrace_policy, backtrace) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
            String::new(),
        ),
        _ => ("unsupported".to_string(), String::new()),
    };

    CrashRecord {
        timestamp_utc: chrono::Utc::now().to_rfc3339(),
        thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
        location: info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string()),
        payload: payload_text(info.payload()),
        backtrace_policy,
        backtrace,
    }
}

fn write_crash_record(crash_dir: &Path, record: &CrashRecord) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = CRASH_RECORD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:04}.json",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    ));
    let mut file = fs::File::create(&path)?;
    serde_json::to_writer_pretty(&mut file, record)?;
    file.write_all(b"\n")?;
    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("roomcook_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "roomcook_core=trace");
        assert_eq!(filters.console_filter, "roomcook_core=trace");
        assert_eq!(filters.file_filter, "roomcook_core=trace");
    }

    #[test]
    fn verbosity_beats_rust_log() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 3,
            ..debug.clone()
        };

        assert_eq!(compose_logging_filters(&debug).console_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).console_filter, "trace");
    }

    #[test]
    fn implicit_filter_quiets_worker_stderr_on_console_only() {
        let options = LoggingInitOptions {
            rust_log_env: Some("info,roomcook_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "info,roomcook_core=debug");
        assert_eq!(
            filters.console_filter,
            "hyper=warn,worker_stderr=warn,info,roomcook_core=debug"
        );
        assert_eq!(
            filters.file_filter,
            "hyper=warn,worker_stderr=debug,info,roomcook_core=debug"
        );
    }

    #[test]
    fn file_filter_adds_worker_debug_when_noise_filter_omits_it() {
        let options = LoggingInitOptions {
            noise_filter: "hyper=error".to_string(),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, "hyper=error,info");
        assert_eq!(filters.file_filter, "hyper=error,worker_stderr=debug,info");
    }

    #[test]
    fn file_sink_lives_under_data_dir_logs() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready(ready) => {
                assert_eq!(ready.log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(ready.retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(ready.log_dir.is_dir());
            }
            FileSinkPlan::Fallback(fallback) => {
                panic!("expected ready file sink, got fallback: {}", fallback.reason)
            }
        }
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let not_a_dir = NamedTempFile::new().expect("temp file");
        let options = LoggingInitOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready(_) => panic!("expected fallback file sink"),
            FileSinkPlan::Fallback(fallback) => {
                assert_eq!(
                    fallback.attempted_log_dir,
                    Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME))
                );
                assert!(fallback.reason.contains("failed to create log directory"));
            }
        }
    }

    #[test]
    fn crash_record_is_written_as_json() {
        let crash_dir = tempdir().expect("tempdir");
        let record = CrashRecord {
            timestamp_utc: "2026-10-16T10:00:00+00:00".to_string(),
            thread: "tokio-runtime-worker".to_string(),
            location: "src/dispatcher.rs:12:7".to_string(),
            payload: "engine state corrupted".to_string(),
            backtrace_policy: "captured".to_string(),
            backtrace: "fake backtrace".to_string(),
        };

        let path = write_crash_record(crash_dir.path(), &record).expect("write crash record");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
        let parsed: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(parsed["payload"], "engine state corrupted");
        assert_eq!(parsed["location"], "src/dispatcher.rs:12:7");
    }

    #[test]
    fn payload_text_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(payload_text(str_payload), "boom");
        assert_eq!(payload_text(string_payload), "kaboom");
        assert_eq!(payload_text(int_payload), "<non-string panic payload>");
    }
}
