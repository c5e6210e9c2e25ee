use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use roomcook_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use roomcook_core::convert::{self, PixelJsonFormat};
use roomcook_core::layout;
use roomcook_core::log_store::CommitGate;
use roomcook_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use roomcook_core::server::{app_router, app_state_with_config};

#[derive(Parser)]
#[command(
    name = "roomcook",
    about = "Task-dispatch server for procedural room generation",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render export/serve/<uuid>.json next to a .hip into <uuid>.png
    Json2png(Json2pngArgs),
    /// Dump an image's pixels as JSON
    Png2json(Png2jsonArgs),
}

#[derive(Args)]
struct Json2pngArgs {
    #[arg(long, help = "Path to the .hip file whose directory holds export/serve")]
    hip: PathBuf,
    #[arg(long)]
    uuid: String,
    #[arg(
        long = "wait-sec",
        default_value_t = 0.0,
        help = "Seconds to wait for the pixel JSON to appear"
    )]
    wait_sec: f64,
}

#[derive(Args)]
struct Png2jsonArgs {
    #[arg(short = 'i', long, help = "Input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output path (defaults to the input with .json)")]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = FormatArg::Metadata)]
    format: FormatArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Simple,
    Metadata,
}

impl From<FormatArg> for PixelJsonFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Simple => PixelJsonFormat::Simple,
            FormatArg::Metadata => PixelJsonFormat::Metadata,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Json2png(args)) => run_json2png(args).await,
        Some(Commands::Png2json(args)) => run_png2json(args).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    // Console output goes to stderr so CLI subcommands keep stdout for JSON.
    let installed = match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_env_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );
            tracing::subscriber::set_global_default(subscriber).map(|_| None)
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );
            tracing::subscriber::set_global_default(subscriber).map(|_| Some(fallback))
        }
    };

    match installed {
        Ok(Some(fallback)) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
        Ok(None) => {}
        Err(error) => {
            eprintln!(
                "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash hook unavailable; panics will not be recorded"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn resolve_bind_addr(
    port_override: Option<u16>,
    host_override: Option<String>,
    port_env: Option<String>,
    config: &AppConfig,
) -> String {
    let port = port_override
        .or_else(|| port_env.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    format!("{host}:{port}")
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let addr = resolve_bind_addr(
        port_override,
        host_override,
        std::env::var("PORT").ok(),
        &config,
    );
    let app = app_router(app_state_with_config(config));

    info!(%addr, "Starting roomcook server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_json2png(args: Json2pngArgs) -> Result<()> {
    if !layout::is_safe_uuid(&args.uuid) {
        bail!("invalid uuid: {}", args.uuid);
    }
    let base = layout::base_dir(&args.hip);
    let wait = Duration::try_from_secs_f64(args.wait_sec.max(0.0)).unwrap_or_default();

    let report = tokio::task::spawn_blocking(move || {
        convert::json_to_png(&base, &args.uuid, wait, &CommitGate::open())
    })
    .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ok {
        bail!(
            "conversion failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_png2json(args: Png2jsonArgs) -> Result<()> {
    let input = args.input.clone();
    let export = tokio::task::spawn_blocking(move || {
        convert::png_to_json(
            &args.input,
            args.output.as_deref(),
            args.format.into(),
            &CommitGate::open(),
        )
    })
    .await??;

    info!(input = %input.display(), output = %export.output.display(), "pixel JSON exported");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "input": input.display().to_string(),
            "output": export.output.display().to_string(),
            "width": export.width,
            "height": export.height,
            "pixels_written": export.pixel_count,
        }))?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["roomcook", "--port", "6060"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(6060));
    }

    #[test]
    fn png2json_subcommand_parses_format() {
        let cli = Cli::try_parse_from([
            "roomcook",
            "png2json",
            "--input",
            "room.png",
            "-o",
            "room.json",
            "--format",
            "simple",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Png2json(args)) => {
                assert_eq!(args.input, PathBuf::from("room.png"));
                assert_eq!(args.output, Some(PathBuf::from("room.json")));
                assert_eq!(PixelJsonFormat::from(args.format), PixelJsonFormat::Simple);
            }
            _ => panic!("expected png2json"),
        }
    }

    #[test]
    fn json2png_subcommand_parses_wait() {
        let cli = Cli::try_parse_from([
            "roomcook", "json2png", "--hip", "/p/room.hip", "--uuid", "U1", "--wait-sec", "2.5",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Json2png(args)) => {
                assert_eq!(args.uuid, "U1");
                assert_eq!(args.wait_sec, 2.5);
            }
            _ => panic!("expected json2png"),
        }
    }

    #[test]
    fn bind_addr_prefers_cli_then_env_then_config() {
        let config = AppConfig::default();
        assert_eq!(
            resolve_bind_addr(Some(7000), None, Some("7100".to_string()), &config),
            "0.0.0.0:7000"
        );
        assert_eq!(
            resolve_bind_addr(None, Some("127.0.0.1".to_string()), Some("7100".to_string()), &config),
            "127.0.0.1:7100"
        );
        assert_eq!(
            resolve_bind_addr(None, None, Some("not-a-port".to_string()), &config),
            "0.0.0.0:5050"
        );
    }

    #[tokio::test]
    async fn png2json_writes_pixel_document() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("room.png");
        let raster = image_bytes();
        std::fs::write(&input, raster).unwrap();

        run_png2json(Png2jsonArgs {
            input: input.clone(),
            output: None,
            format: FormatArg::Metadata,
        })
        .await
        .unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("room.json")).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["width"], 1);
    }

    #[tokio::test]
    async fn json2png_reports_missing_pixel_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_json2png(Json2pngArgs {
            hip: dir.path().join("room.hip"),
            uuid: "U1".to_string(),
            wait_sec: 0.0,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("conversion failed"));
    }

    fn image_bytes() -> Vec<u8> {
        let raster = roomcook_core::pixel_codec::encode(&[[0.0, 0.5, 1.0]], 1).unwrap();
        convert::encode_png(&raster).unwrap()
    }
}
