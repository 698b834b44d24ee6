//! termgate
//!
//! Serves shell sessions to browsers over WebSocket.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gateway::config::Config;
use gateway::orchestrator::{GatewayOrchestrator, OrchestratorEvent};
use tracing_subscriber::EnvFilter;

/// termgate - terminal session gateway.
#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the gateway until SIGINT or SIGTERM
    Serve {
        /// Listen address, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Commands::Serve {
        bind: Some(bind), ..
    } = &cli.command
    {
        config.server.bind = bind.clone();
    }

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    config.validate()?;

    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!("termgate starting...");
            let mut orchestrator = GatewayOrchestrator::new(config)?;
            run_gateway(&mut orchestrator).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Run the gateway until a shutdown signal arrives.
async fn run_gateway(orchestrator: &mut GatewayOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionsReclaimed { ids } => {
                    tracing::info!(count = ids.len(), "Reclaimed stale sessions");
                }
            }
        }
    });

    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("Listening on ws://{}", addr);
    }

    wait_for_shutdown_signal().await?;

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["termgate", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind } => assert!(bind.is_none()),
            _ => panic!("Expected Serve command"),
        }
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_serve_with_bind() {
        let cli = Cli::try_parse_from(["termgate", "serve", "--bind", "0.0.0.0:8080"]).unwrap();
        match cli.command {
            Commands::Serve { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:8080")),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["termgate", "config", "--verbose", "-c", "/etc/termgate.toml"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termgate.toml")));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["termgate"]).is_err());
    }
}
