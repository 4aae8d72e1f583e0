//! Command-line interface for the NeoMind extension host.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neomind_api::ServerState;
use neomind_extension_host::config::env_vars;
use neomind_extension_host::extension::install_extension_panic_hook;
use neomind_extension_host::{ExtensionService, HostConfig};
use tokio::sync::watch;

/// NeoMind extension host - load, sandbox and serve edge extensions.
#[derive(Parser, Debug)]
#[command(name = "neomind-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Host configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Discover extensions and serve the HTTP API.
    Serve {
        /// Extension directory, overriding the configuration.
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Address to bind to, overriding the configuration.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Discover extensions and print what loaded.
    List {
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Load a single extension file and print its descriptor.
    Validate {
        /// Path to a .so/.dylib/.dll or .wasm file.
        #[arg(required = true)]
        path: PathBuf,
    },
    /// Run one command on an extension and print the result.
    Call {
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Extension id.
        id: String,
        /// Command name.
        command: String,
        /// Command arguments as a JSON object.
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_extension_panic_hook();

    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { dir, bind } => run_server(with_dir(config, dir), bind).await,
        Command::List { dir, json } => list_extensions(with_dir(config, dir), json).await,
        Command::Validate { path } => validate_extension(config, &path).await,
        Command::Call {
            dir,
            id,
            command,
            args,
        } => call_command(with_dir(config, dir), &id, &command, &args).await,
    }
}

/// `1` and `true` (any case) switch on JSON logs.
fn json_logging_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true")
    })
}

fn init_tracing(verbose: bool) {
    // JSON format for production/container environments
    let json_logging = json_logging_enabled(std::env::var(env_vars::LOG_JSON).ok().as_deref());

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "neomind_extension_host={default_level},neomind_api={default_level},neomind_host={default_level},warn"
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let config = match path {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => HostConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn with_dir(mut config: HostConfig, dir: Option<PathBuf>) -> HostConfig {
    if let Some(dir) = dir {
        config.extensions.dir = dir;
    }
    config
}

async fn run_server(mut config: HostConfig, bind: Option<SocketAddr>) -> Result<()> {
    let bind = match bind {
        Some(bind) => bind,
        None => config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", config.server.bind))?,
    };
    config.server.bind = bind.to_string();

    let service = Arc::new(ExtensionService::new(config));
    let report = service.discover().await?;
    tracing::info!(
        loaded = report.loaded.len(),
        failed = report.failures.len(),
        "Initial discovery complete"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = service.spawn_background(shutdown_rx);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    };
    let served = neomind_api::run(ServerState::new(Arc::clone(&service)), bind, shutdown).await;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    served
}

async fn list_extensions(config: HostConfig, json: bool) -> Result<()> {
    let service = ExtensionService::new(config);
    let report = service.discover().await?;
    let extensions = service.list().await;

    if json {
        let out = serde_json::json!({
            "extensions": extensions,
            "failures": report.failures,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if extensions.is_empty() {
        println!("No extensions found in {}", service.config().extensions.dir.display());
    }
    for ext in &extensions {
        println!(
            "{:<28} {:<10} {:<7} {} metric(s), {} command(s)",
            ext.metadata.id,
            ext.metadata.version.to_string(),
            ext.kind.to_string(),
            ext.metric_count,
            ext.command_count
        );
    }
    for failure in &report.failures {
        println!(
            "FAILED {} [{}]: {}",
            failure.path.display(),
            failure.error.kind(),
            failure.error
        );
    }
    Ok(())
}

async fn validate_extension(config: HostConfig, path: &Path) -> Result<()> {
    let service = ExtensionService::new(config);
    let handle = match service.registry().load_from_path(path).await {
        Ok(handle) => handle,
        Err(e) => {
            println!("Extension Validation: FAILED");
            println!();
            println!("Error [{}]: {}", e.kind(), e);
            anyhow::bail!("{} is not a loadable extension", path.display());
        }
    };

    let metadata = handle.metadata();
    println!("Extension Validation: PASSED");
    println!();
    println!("ID:              {}", metadata.id);
    println!("Name:            {}", metadata.name);
    println!("Version:         {}", metadata.version);
    println!("Kind:            {}", handle.kind());
    println!("Metrics:         {}", handle.metrics().len());
    for metric in handle.metrics() {
        println!("  - {} ({})", metric.name, metric.data_type.as_str());
    }
    println!("Commands:        {}", handle.commands().len());
    for command in handle.commands() {
        println!("  - {}", command.name);
    }
    Ok(())
}

async fn call_command(config: HostConfig, id: &str, command: &str, args: &str) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(args).context("--args must be valid JSON")?;

    let service = ExtensionService::new(config);
    service.discover().await?;
    let result = service.execute_command(id, command, args).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
