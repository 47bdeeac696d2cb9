//! `flintd` entrypoint: loads configuration and runs the realtime gateway.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gateway::credentials::validate_model_name;
use gateway::{ClusterMode, GatewayConfig, select_adapter};
use proto::ConfigError;

#[cfg(not(test))]
use gateway::Gateway;
#[cfg(not(test))]
use tracing::{error, info};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(not(test))]
use crate::daemon::{PidFile, wait_for_shutdown};

/// Command-line arguments for the flint gateway daemon.
#[derive(Parser)]
#[command(name = "flintd")]
#[command(about = "Realtime WebSocket gateway", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write debug logs to ~/.flint/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// PID file path (default ~/.flint/flintd.pid)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the gateway until SIGINT/SIGTERM (default)
    Start,
    /// Validate the configuration and exit
    Check,
}

/// Outcome of `flintd check`.
#[derive(Debug, PartialEq, Eq)]
struct CheckSummary {
    adapter: Option<String>,
    credential_model: String,
    credentials_url: Option<String>,
}

impl std::fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.adapter {
            Some(name) => writeln!(f, "cluster: {name}")?,
            None => writeln!(f, "cluster: standalone")?,
        }
        match &self.credentials_url {
            Some(url) => write!(f, "credentials: {} ({url})", self.credential_model),
            None => write!(f, "credentials: static tokens"),
        }
    }
}

/// Runs adapter selection and credential model validation without starting anything.
fn check_config(config: &GatewayConfig) -> Result<CheckSummary, ConfigError> {
    let adapter = match select_adapter(config.realtime.adapter.as_ref(), &config.datasources)? {
        ClusterMode::Standalone => None,
        ClusterMode::Clustered(adapter) => Some(adapter.name().to_string()),
    };
    let model = config::credential_model(config);
    validate_model_name(model)?;
    let credentials_url = config::credentials_url(config)?.map(str::to_string);
    Ok(CheckSummary {
        adapter,
        credential_model: model.to_string(),
        credentials_url,
    })
}

#[cfg(not(test))]
fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if !cli.debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
        return None;
    }

    let log_dir = config::flint_home().join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_target(false).with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug,hyper_util=info,tungstenite=info,sqlx=info"));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

#[cfg(not(test))]
async fn run_start(config: GatewayConfig, pid_file: PidFile) -> anyhow::Result<()> {
    let validator = config::build_validator(&config).await?;
    let gateway = Gateway::new(config, validator);
    let addr = gateway.connect().await?;
    info!(%addr, "flintd listening");

    if let Err(e) = pid_file.write().await {
        error!("Failed to write PID file {}: {e}", pid_file.path().display());
    }

    wait_for_shutdown().await;

    let result = gateway.shutdown().await;
    pid_file.remove().await;
    result?;
    info!("flintd stopped");
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Flushes buffered debug-file writes on exit.
    let _file_guard = init_tracing(&cli);

    let command = cli.command.unwrap_or(Commands::Start);
    if cli.debug {
        info!(command = ?command, "flintd session started");
    }

    let config = config::load_config(cli.config.as_deref())?;
    match command {
        Commands::Start => {
            let pid_file = PidFile::new(cli.pid_file.unwrap_or_else(PidFile::default_path));
            run_start(config, pid_file).await
        }
        Commands::Check => match check_config(&config) {
            Ok(summary) => {
                println!("{summary}");
                println!("configuration ok");
                Ok(())
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                std::process::exit(1);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::config::{AdapterSettings, DatasourceSettings};

    #[test]
    fn start_is_the_default_command() {
        let cli = Cli::try_parse_from(["flintd"]).expect("parse");
        assert_eq!(cli.command, None);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.debug);

        let cli = Cli::try_parse_from([
            "flintd",
            "-c",
            "/etc/flint.toml",
            "--debug",
            "--pid-file",
            "/run/flintd.pid",
            "check",
        ])
        .expect("parse");
        assert_eq!(cli.command, Some(Commands::Check));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/flint.toml")));
        assert_eq!(cli.pid_file, Some(PathBuf::from("/run/flintd.pid")));
        assert!(cli.debug);
    }

    #[test]
    fn check_reports_standalone_defaults() {
        let summary = check_config(&GatewayConfig::default()).expect("valid");
        assert_eq!(summary.adapter, None);
        assert_eq!(summary.credential_model, "AccessToken");
        assert_eq!(summary.credentials_url, None);
        assert_eq!(
            summary.to_string(),
            "cluster: standalone\ncredentials: static tokens"
        );
    }

    #[test]
    fn check_reports_memory_adapter() {
        let mut config = GatewayConfig::default();
        config.realtime.adapter = Some(AdapterSettings {
            name: Some("memory".to_string()),
            datasource: Some("bus".to_string()),
        });
        config.datasources.insert(
            "bus".to_string(),
            DatasourceSettings {
                url: Some("memory://local".to_string()),
                ..DatasourceSettings::default()
            },
        );
        let summary = check_config(&config).expect("valid");
        assert_eq!(summary.adapter.as_deref(), Some("memory"));
    }

    #[test]
    fn check_fails_on_half_configured_adapter() {
        let mut config = GatewayConfig::default();
        config.realtime.adapter = Some(AdapterSettings {
            name: Some("memory".to_string()),
            datasource: None,
        });
        assert!(matches!(
            check_config(&config),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn check_fails_on_invalid_model_name() {
        let mut config = GatewayConfig::default();
        config.realtime.custom.access_token = Some("tokens; --".to_string());
        assert!(matches!(
            check_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
