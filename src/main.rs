use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use connect_proxy::config::{load_config, validation::validate_config, ConfigError, ProxyConfig};
use connect_proxy::lifecycle::{self, Shutdown};
use connect_proxy::observability::logging::init_logging;

/// HTTP/2 CONNECT and forward proxy.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file. Built-in defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the primary (TLS) listener port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the plain listener port.
    #[arg(long)]
    plain_port: Option<u16>,

    /// Override the log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn with_port(address: &str, port: u16) -> String {
    match address.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{address}:{port}"),
    }
}

fn resolve_config(args: &Args) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(port) = args.port {
        config.listener.primary_address = with_port(&config.listener.primary_address, port);
    }
    if let Some(port) = args.plain_port {
        config.listener.plain_address = with_port(&config.listener.plain_address, port);
    }
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("connect-proxy: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.observability.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = ?args.config,
        authenticate = config.authenticate.is_required(),
        http1_secured = config.http1_secured,
        "connect-proxy starting"
    );

    let server = match lifecycle::start(config).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        lifecycle::wait_for_signal().await;
        trigger.trigger();
    });

    if let Err(err) = server.run(shutdown).await {
        tracing::error!(error = %err, "Server failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
