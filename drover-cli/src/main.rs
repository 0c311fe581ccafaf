use anyhow::{Context, Result};
use clap::Parser;
use drover_cluster::{
    BootstrapError, CommandSpawner, Supervisor, WorkerBootstrap, WorkerContext, WorkerState,
};
use drover_config::{ConfigLoader, DroverConfig, LogFormat};
use drover_logging::{init_forwarding_tracing, init_simple_tracing, LogOutput};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod cli;
mod entries;

use cli::{Cli, Commands, ConfigCommands};

/// Exit code for an entry that returned an error
const EXIT_ENTRY_FAILED: i32 = 1;

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<DroverConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

fn log_output(format: LogFormat) -> LogOutput {
    match format {
        LogFormat::Text => LogOutput::Text,
        LogFormat::Compact => LogOutput::Compact,
        LogFormat::Json => LogOutput::Json,
    }
}

/// Run a cluster until ctrl-c or SIGTERM
async fn serve_command(
    config_path: Option<&PathBuf>,
    log_level: Option<&String>,
    workers: Option<usize>,
    listen: &str,
    entry: &str,
) -> Result<()> {
    let config = load_config(config_path)?;

    let level = log_level
        .cloned()
        .unwrap_or_else(|| config.logging.level.to_string());
    init_simple_tracing(&level, log_output(config.logging.format))?;

    if entries::lookup(entry).is_none() {
        return Err(anyhow::anyhow!(
            "Unknown entry: {}. Available entries: {}",
            entry,
            entries::names().join(", ")
        ));
    }

    let worker_count = workers.unwrap_or(config.cluster.workers);
    let spawner = CommandSpawner::current_exe(entry)
        .context("Failed to locate the drover executable")?
        .arg(listen)
        .env("DROVER_LOG_LEVEL", &level)
        .env(
            "DROVER_WORKER_TIMEOUT_MS",
            config.cluster.worker_timeout.as_millis().to_string(),
        );

    let mut supervisor = Supervisor::new(config.cluster.clone(), Arc::new(spawner))?;
    supervisor
        .start(worker_count)
        .await
        .context("Failed to start workers")?;
    let mut messages = supervisor.iterate()?;

    info!(
        "Serving {} on {} with {} workers",
        entry, listen, worker_count
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            event = messages.next() => match event {
                Some(event) => info!(worker_id = %event.worker_id, "{}", event.payload),
                None => {
                    warn!("All workers have exited");
                    break;
                }
            },
        }
    }

    let exited = supervisor
        .workers()
        .iter()
        .filter(|worker| worker.state == WorkerState::Exited)
        .count();
    if exited > 0 {
        warn!("{} workers exited before shutdown", exited);
    }

    let report = supervisor.stop().await?;
    info!(
        "Shutdown complete ({} clean, {} killed)",
        report.clean, report.killed
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run as a worker process and return its exit code
///
/// Nothing may be written to stdout here: it carries the control channel.
async fn run_worker_process(args: Vec<String>) -> i32 {
    match worker_main(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("drover worker: {}", e);
            e.exit_code()
        }
    }
}

async fn worker_main(args: Vec<String>) -> Result<i32, BootstrapError> {
    let bootstrap = WorkerBootstrap::from_args(args)?;
    let entry = entries::lookup(&bootstrap.entry)
        .ok_or_else(|| BootstrapError::UnknownEntry(bootstrap.entry.clone()))?;
    let config = ConfigLoader::new()
        .from_env()
        .map_err(|e| BootstrapError::Usage(e.to_string()))?;

    // An interactive ctrl-c hits the whole process group; the controller drives shutdown
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ignoring interrupt, waiting for the controller");
        }
    });

    let ctx = WorkerContext::from_stdio(&bootstrap, config.cluster.worker_timeout).await?;

    if let Some(forwarder) = ctx.log_forwarder() {
        if let Err(e) = init_forwarding_tracing(&config.logging.level.to_string(), forwarder) {
            eprintln!("drover worker: {}", e);
        }
    }
    debug!(
        "Worker {} running entry {}",
        bootstrap.worker_id, bootstrap.entry
    );

    if let Err(e) = entry(ctx.clone(), bootstrap.args.clone()).await {
        error!("Entry {} failed: {:#}", bootstrap.entry, e);
        ctx.shutdown().await;
        return Ok(EXIT_ENTRY_FAILED);
    }

    ctx.terminated().await;
    Ok(0)
}

/// Handle configuration validation
fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &Path, force: bool) -> Result<()> {
    info!("Generating configuration at: {:?}", output);

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    fs::write(output, DroverConfig::generate_sample())
        .context("Failed to write configuration file")?;

    println!("Configuration generated at: {:?}", output);
    println!(
        "Validate with: drover config validate --config-file {:?}",
        output
    );
    Ok(())
}

/// Handle configuration display
fn handle_config_show(config_file: Option<&PathBuf>, format: &str) -> Result<()> {
    let config = load_config(config_file)?;

    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output =
                serde_yaml::to_string(&config).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output =
                serde_json::to_string_pretty(&config).context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Worker mode sets up its own (forwarding) tracing after the handshake
        Some(Commands::Worker { args }) => {
            let code = run_worker_process(args).await;
            std::process::exit(code);
        }
        Some(Commands::Serve {
            config,
            workers,
            listen,
            entry,
        }) => {
            serve_command(
                config.as_ref(),
                cli.log_level.as_ref(),
                workers,
                &listen,
                &entry,
            )
            .await
        }
        Some(Commands::Config { config_cmd }) => {
            let level = cli.log_level.unwrap_or_else(|| "warn".to_string());
            init_simple_tracing(&level, LogOutput::Text)?;

            match config_cmd {
                ConfigCommands::Validate { config_file } => handle_config_validate(&config_file),
                ConfigCommands::Generate { output, force } => handle_config_generate(&output, force),
                ConfigCommands::Show {
                    config_file,
                    format,
                } => handle_config_show(config_file.as_ref(), &format),
            }
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
