use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use sketchsplit_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use sketchsplit_core::edges::{EdgeDetector, GradientEdgeDetector};
use sketchsplit_core::logging::{
    self, FileSink, LoggingOptions, PanicHookStatus, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use sketchsplit_core::server::{app_router, app_state_with_config};
use sketchsplit_core::storage::sanitize_stem;

#[derive(Parser)]
#[command(
    name = "sketchsplit",
    about = "Turn photos into line art and stylized sketches",
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
    /// Extract line art from a local image without starting the server.
    Edges(EdgesArgs),
}

#[derive(Args)]
struct EdgesArgs {
    #[arg(help = "Path to a JPEG or PNG photo")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Where to write the edge map (PNG)")]
    output: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Some(Commands::Edges(args)) => run_edges(args, &resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);

    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::select_filters(&options).effective;

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter(&filter, "console"));

    let installed = match logging::open_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(appender))
                .with_filter(parse_env_filter(&filter, "file"));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console).with(file),
            )
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let result =
                tracing::subscriber::set_global_default(tracing_subscriber::registry().with(console));
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
            result
        }
    };
    if let Err(error) = installed {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }

    if let PanicHookStatus::Disabled(reason) = panic_hook {
        warn!(reason = %reason, "Panic crash artifact hook unavailable");
    }
}

fn parse_env_filter(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.stylize.apply_env_overrides();
    config
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, &data_dir)?;
    info!(
        storage_root = %state.storage().root().display(),
        public_mount = %state.storage().public_mount(),
        "Temporary storage ready"
    );
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting sketchsplit server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn run_edges(args: EdgesArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let output = args
        .output
        .unwrap_or_else(|| default_edges_output(&args.input));
    let input = args.input;

    let written = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let bytes = std::fs::read(&input)
            .with_context(|| format!("failed to read input image: {}", input.display()))?;
        GradientEdgeDetector::new(&config.edges).detect_edges(&bytes, &output)
    })
    .await
    .context("edge extraction task aborted")??;

    info!(path = %written.display(), "Edge map written");
    println!("{}", written.display());
    Ok(())
}

/// `edge_<stem>.png` next to the input.
fn default_edges_output(input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("edge_{}.png", sanitize_stem(&name)))
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;

    fn effective(rust_log: Option<&str>, verbose: u8, cli: Option<&str>) -> String {
        logging::select_filters(&LoggingOptions {
            verbose,
            cli_log_filter: cli.map(ToString::to_string),
            rust_log_env: rust_log.map(ToString::to_string),
            ..Default::default()
        })
        .effective
    }

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        assert_eq!(
            effective(None, 0, None),
            format!("{},info", logging::DEFAULT_NOISE_FILTER)
        );
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        assert_eq!(effective(Some("info"), 1, None), "debug");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        assert_eq!(
            effective(Some("warn"), 2, Some("sketchsplit_core=trace")),
            "sketchsplit_core=trace"
        );
    }
}
