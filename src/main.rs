//! MySQL MCP gateway entry point.
//!
//! Diagnostics for the connection core plus a `serve` mode that keeps the
//! registry alive until a shutdown signal arrives. All logs go to stderr;
//! command output goes to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mysql_mcp_gateway::database::MySqlConnector;
use mysql_mcp_gateway::resilience::{get_handle_with_retry, RetryConfig};
use mysql_mcp_gateway::shutdown::{install_signal_handlers, new_shutdown_controller, ShutdownConfig};
use mysql_mcp_gateway::{ConfigResolver, ConnectionRegistry, RegistryConfig, ServerError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mysql-mcp-gateway")]
#[command(about = "Connection and configuration core of the MySQL MCP gateway")]
#[command(version)]
struct Cli {
    /// Project directory holding config/mysql-connections.json and .env
    #[arg(long, global = true, env = "MYSQL_GATEWAY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every configuration source and which one is active
    Sources,

    /// List configured connection profiles
    List,

    /// Test one profile (the default when omitted) or all of them
    Test {
        /// Profile name
        profile: Option<String>,

        /// Test every configured profile
        #[arg(long, conflicts_with = "profile")]
        all: bool,

        /// Connection attempts for transient failures
        #[arg(long, default_value_t = 1)]
        retries: u32,
    },

    /// Connect the default profile and report the status of every profile
    Status,

    /// Keep the registry alive until Ctrl+C or SIGTERM
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut resolver = ConfigResolver::new();
    if let Some(dir) = cli.project_dir {
        resolver = resolver.with_project_dir(dir);
    }

    let registry = ConnectionRegistry::new(
        resolver,
        Arc::new(MySqlConnector),
        RegistryConfig::from_env(),
    );

    let outcome = run(&registry, cli.command).await;
    registry.close_all().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run a registry command. `Ok(false)` means the command ran but reported a failure.
async fn run(registry: &ConnectionRegistry, command: Commands) -> Result<bool> {
    match command {
        Commands::Sources => {
            println!("{}", registry.resolution()?.summary());
            Ok(true)
        }

        Commands::List => {
            let default = registry.default_profile_name()?;
            for profile in registry.list_profiles()? {
                let marker = if profile.name == default { "*" } else { " " };
                println!(
                    "{} {} [{}] {}",
                    marker,
                    profile.name,
                    profile.environment,
                    profile.description.as_deref().unwrap_or("")
                );
            }
            Ok(true)
        }

        Commands::Test {
            profile,
            all,
            retries,
        } => {
            if all {
                let results = registry.test_all_profiles().await?;
                print_json(&results)?;
                return Ok(results.values().all(|r| r.success));
            }

            let name = match profile {
                Some(name) => name,
                None => registry.default_profile_name()?,
            };

            let retry = RetryConfig::from_env().with_attempts(retries);
            if retry.max_attempts > 1 {
                if let Err(e) = get_handle_with_retry(registry, Some(&name), &retry).await {
                    warn!(profile = %name, "giving up after retries: {}", e);
                }
            }

            let result = registry.test_profile(&name).await?;
            print_json(&result)?;
            Ok(result.success)
        }

        Commands::Status => {
            if let Err(e) = registry.get_handle(None).await {
                report_unavailable(&e);
            }
            let status = registry.status_snapshot().await?;
            print_json(&status)?;
            Ok(true)
        }

        Commands::Serve => {
            let controller = new_shutdown_controller(ShutdownConfig::from_env());
            install_signal_handlers(controller.clone());

            let resolution = registry.resolution()?;
            info!(
                source = %resolution.selected(),
                profiles = resolution.topology().len(),
                "Configuration loaded"
            );

            match registry.get_handle(None).await {
                Ok(handle) => info!(profile = %handle.profile_name(), "Default connection ready"),
                Err(e) => report_unavailable(&e),
            }

            eprintln!("Ready. Press Ctrl+C to stop.");
            controller.signal().recv().await;
            controller.graceful_shutdown(registry).await;
            Ok(true)
        }
    }
}

fn report_unavailable(e: &ServerError) {
    warn!("Default connection unavailable: {}", e);
    if let Some(hint) = e.suggestion() {
        eprintln!("Hint: {hint}");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{json}");
    Ok(())
}

/// Initialize tracing subscriber with stderr output.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,mysql_mcp_gateway=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
