use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;

use sandbox_harness::logging::{init_logging, init_logging_with_file, DEFAULT_LOG_FILE};
use sandbox_harness::settings::{create_sample_config, EnvironmentConfig, DEFAULT_CONFIG_PATH};
use sandbox_harness::{HarnessSettings, ProcessLauncher, Sandbox};

#[derive(Parser)]
#[command(name = "sandbox-harness")]
#[command(about = "Launch and tear down sandbox environments for integration tests")]
struct Args {
    /// Settings file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to a file, rotated at 5 MiB
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured environments
    List,
    /// Print the rendered start command and base URL of an environment
    Render { key: String },
    /// Launch an environment and keep it running until Ctrl+C
    Up { key: String },
    /// Stop a running environment by name
    Stop { key: String },
    /// Remove a previous container and its state directories
    Cleanup { key: String },
    /// Write the default settings to a file
    SampleConfig { path: PathBuf },
}

/// Wait for shutdown signal (CTRL+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.log_file {
        Some(path) => init_logging_with_file(&args.log_level, path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?,
        None => init_logging(&args.log_level),
    }

    let config_path = args.config;
    let load_settings = || {
        HarnessSettings::load(&config_path)
            .with_context(|| format!("Failed to load settings from {}", config_path.display()))
    };

    match args.command {
        Commands::SampleConfig { path } => create_sample_config(&path)?,
        Commands::List => {
            let settings = load_settings()?;
            for (name, env) in &settings.environments {
                let kind = match env {
                    EnvironmentConfig::Managed(_) => "managed",
                    EnvironmentConfig::External(_) => "external",
                };
                let base_url = settings.environment(name)?.base_url().unwrap_or_default();
                println!("{name}\t{kind}\t{base_url}");
            }
        }
        Commands::Render { key } => {
            let settings = load_settings()?;
            let env = settings.environment(&key)?;
            match env.launch_spec(&settings.layout()) {
                Some(spec) => {
                    println!("command: {}", spec.command);
                    println!("ready message: {}", spec.ready_marker);
                    println!("startup timeout: {:?}", spec.startup_timeout);
                }
                None => println!("external environment, nothing to launch"),
            }
            if let Some(base_url) = env.base_url() {
                println!("base url: {base_url}");
            }
        }
        Commands::Up { key } => {
            let settings = load_settings()?;
            let mut sandbox = Sandbox::start(&settings, &key).await?;
            if let Some(endpoint) = sandbox.endpoint() {
                log::info!("'{key}' serving at {}", endpoint.base_url);
            }
            shutdown_signal().await;
            sandbox.shutdown().await;
        }
        Commands::Stop { key } => {
            let settings = load_settings()?;
            let env = settings.environment(&key)?;
            ProcessLauncher::from_settings(&settings).stop(&env).await;
        }
        Commands::Cleanup { key } => {
            let settings = load_settings()?;
            let env = settings.environment(&key)?;
            ProcessLauncher::from_settings(&settings).cleanup(&env).await;
        }
    }

    Ok(())
}
