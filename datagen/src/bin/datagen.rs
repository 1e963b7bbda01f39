use std::{env, net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use datagen::{
    config::{self, Config},
    coordinator::{self, Coordinator},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, time::Duration};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] coordinator::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

impl Error {
    fn exit_code(&self) -> u8 {
        match self {
            Error::Coordinator(err) => u8::try_from(err.exit_code()).unwrap_or(2),
            _ => 2,
        }
    }
}

fn default_config_path() -> String {
    "/etc/datagen/datagen.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate records and send them to the collector
    Run(RunCommand),
    /// Validate the configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address to expose prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for tasks to finish on shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn get_config(config_path: &str) -> Result<Config, Error> {
    let config = if let Ok(env_var_value) = env::var("DATAGEN_CONFIG") {
        debug!("Using config from env var 'DATAGEN_CONFIG'");
        config::parse(&env_var_value)?
    } else {
        config::load_config_from_path(&PathBuf::from(config_path))?
    };
    config.validate().map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    Ok(config)
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn termination() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("Could not install SIGTERM handler: {err}");
                if signal::ctrl_c().await.is_err() {
                    error!("Could not listen for ctrl-c");
                }
                return;
            }
        };
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(err) = res {
                    error!("Could not listen for ctrl-c: {err}");
                }
                info!("received ctrl-c");
            }
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
        }
    }
}

async fn inner_main(
    config: Config,
    prometheus_addr: Option<SocketAddr>,
) -> Result<coordinator::Outcome, Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Serving prometheus metrics on {addr}");
    }

    let coordinator = Coordinator::new(&config)?;
    Ok(coordinator.run(termination()).await?)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting datagen {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(args) => {
            return match get_config(&args.config_path) {
                Ok(_) => {
                    info!("Configuration file is valid");
                    ExitCode::SUCCESS
                }
                Err(_) => ExitCode::FAILURE,
            };
        }
    };

    let config = match get_config(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(err.exit_code());
        }
    };

    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());
    let runtime = match Builder::new_multi_thread().enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Could not build the runtime: {err}");
            return ExitCode::from(2);
        }
    };
    let res = runtime.block_on(inner_main(config, args.prometheus_addr));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);

    match res {
        Ok(outcome) => {
            info!("Bye. :)");
            let code = u8::try_from(outcome.exit_code()).unwrap_or(2);
            ExitCode::from(code)
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use datagen::{config, coordinator, sink};

    use super::{Cli, Commands, Error};

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["datagen", "run"]).expect("valid arguments");
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        assert_eq!(args.config_path, "/etc/datagen/datagen.yaml");
        assert!(args.prometheus_addr.is_none());
        assert_eq!(args.max_shutdown_delay, 30);
    }

    #[test]
    fn config_check_path() {
        let cli = Cli::try_parse_from(["datagen", "config-check", "--config-path", "/tmp/d.yaml"])
            .expect("valid arguments");
        let Commands::ConfigCheck(args) = cli.command else {
            panic!("expected the config-check subcommand");
        };
        assert_eq!(args.config_path, "/tmp/d.yaml");
    }

    #[test]
    fn error_exit_codes() {
        let err = config::parse("bogus: 1").expect_err("unknown key");
        assert_eq!(Error::Config(err).exit_code(), 2);

        let err = coordinator::Error::Sink(sink::Error::RetriesExhausted { retries: 3 });
        assert_eq!(Error::Coordinator(err).exit_code(), 127);
    }

    #[test]
    fn prometheus_addr_parsed() {
        let cli = Cli::try_parse_from(["datagen", "run", "--prometheus-addr", "0.0.0.0:9000"])
            .expect("valid arguments");
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        assert_eq!(
            args.prometheus_addr.map(|a| a.port()),
            Some(9000)
        );
    }
}
