use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dnsbro::config::DEFAULT_CONFIG_PATH;
use dnsbro::{Config, Daemon, Error, logging};
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "dnsbro")]
#[command(about = "Local DNS daemon with DNS-over-HTTPS forwarding", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Serve {
        /// Override the configured listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Validate the configuration and print the effective settings
    Check,
    /// Print a configuration file with every default filled in
    SampleConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => serve(&args.config, listen),
        Command::Check => {
            let config = Config::load(&args.config)
                .with_context(|| format!("loading {}", args.config.display()))?;
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Command::SampleConfig => {
            print!("{}", Config::default().to_yaml()?);
            Ok(())
        }
    }
}

/// Load the config for startup; a missing file means defaults.
fn load_startup_config(path: &Path) -> Result<(Config, bool)> {
    match Config::load(path) {
        Ok(config) => Ok((config, true)),
        Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Ok((Config::default(), false)),
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

fn serve(path: &Path, listen: Option<SocketAddr>) -> Result<()> {
    let (mut config, found) = load_startup_config(path)?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    logging::init(&config.log);
    if !found {
        warn!(path = %path.display(), "config file not found, using defaults");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    rt.block_on(run(path.to_path_buf(), config, listen))
}

async fn run(path: PathBuf, config: Config, listen: Option<SocketAddr>) -> Result<()> {
    let daemon = Arc::new(Daemon::new(config, None).context("starting daemon")?);

    spawn_stats_logger(daemon.clone());
    spawn_reload_listener(daemon.clone(), path, listen);

    match daemon.run(shutdown_signal()).await {
        Err(e) if e.is_cancelled() => {
            info!("stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

fn spawn_stats_logger(daemon: Arc<Daemon>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = daemon.stats();
            info!(
                queries = stats.queries,
                blocked = stats.blocked,
                failures = stats.failures,
                avg_response_ms = %format!("{:.2}", stats.avg_response_ms),
                "stats"
            );
        }
    });
}

#[cfg(unix)]
fn spawn_reload_listener(daemon: Arc<Daemon>, path: PathBuf, listen: Option<SocketAddr>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "reloading configuration");
            match Config::load(&path) {
                Ok(mut config) => {
                    if let Some(listen) = listen {
                        config.listen = listen;
                    }
                    // Failures are logged by the daemon.
                    let _ = daemon.reload(config);
                }
                Err(e) => warn!(error = %e, "reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_daemon: Arc<Daemon>, _path: PathBuf, _listen: Option<SocketAddr>) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
