use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fleetwarden::adapter::{ProcessAdapter, TimedAdapter};
use fleetwarden::bus::EventBus;
use fleetwarden::config::{ProcessConfig, WardenConfig};
use fleetwarden::process::LocalProcessManager;
use fleetwarden::stream::{self, Gatekeeper, StreamHub, TokenSigner, DEFAULT_SCOPE};
use fleetwarden::watchdog::Watchdog;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// fleetwarden - supervise a fleet, watch its resources, stream its telemetry
#[derive(Parser)]
#[command(name = "fleetwarden")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleet with the watchdog and the stream server
    Run {
        /// Fleet definition (TOML or JSON)
        #[arg(short, long)]
        fleet: Option<PathBuf>,

        /// Address for the stream server
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Where `dump` writes the fleet definition
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Log as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print a signed stream token
    Token {
        #[arg(short, long)]
        subject: String,

        /// Lifetime in seconds (defaults to SSE_TOKEN_TTL_SECONDS)
        #[arg(long)]
        ttl_secs: Option<u64>,

        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetwarden=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

async fn run(fleet: Option<PathBuf>, bind: SocketAddr, dump: Option<PathBuf>) -> Result<()> {
    let config = WardenConfig::from_env().context("invalid environment configuration")?;
    let signer = TokenSigner::from_config(&config.stream)?;

    let mut manager = LocalProcessManager::new();
    if let Some(path) = dump {
        manager = manager.with_dump_path(path);
    }
    let supervisor = manager.supervise();

    let adapter: Arc<dyn ProcessAdapter> = Arc::new(TimedAdapter::new(manager.clone()));

    let bus = EventBus::new(adapter.clone(), config.bus.clone());
    let relay = bus.start().context("process manager bus unavailable")?;

    // The relay is subscribed, so first lifecycle records and log lines land in the rings
    if let Some(path) = fleet {
        let specs = ProcessConfig::from_file(&path)
            .with_context(|| format!("failed to load fleet from {}", path.display()))?;
        for spec in &specs {
            match adapter.start(spec).await {
                Ok(()) => tracing::info!(process = %spec.name, "fleet entry started"),
                Err(e) => tracing::error!(process = %spec.name, "failed to start fleet entry: {}", e),
            }
        }
    }

    let mut watchdog = tokio::spawn(Watchdog::new(adapter.clone(), config.watchdog.clone()).run());

    let hub = Arc::new(StreamHub::new(bus, Gatekeeper::new(config.stream.clone(), signer)));
    let sweeper = hub.spawn_sweeper();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(stream::serve(hub.clone(), bind, async move {
        let _ = stop_rx.await;
    }));

    let mut server_done = false;
    let outcome: Result<()> = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        joined = &mut watchdog => match joined {
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("watchdog failed to start")),
            Ok(Ok(())) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("watchdog task failed")),
        },
        joined = &mut server => {
            server_done = true;
            match joined {
                Ok(result) => result.context("stream server stopped"),
                Err(e) => Err(anyhow::Error::new(e).context("stream server task failed")),
            }
        }
    };

    tracing::info!("shutting down");
    hub.close_all();
    let _ = stop_tx.send(());
    if !server_done && tokio::time::timeout(Duration::from_secs(5), &mut server).await.is_err() {
        tracing::warn!("stream server did not stop in time");
        server.abort();
    }

    watchdog.abort();
    sweeper.abort();
    relay.abort();
    manager.stop_all().await;
    supervisor.abort();

    outcome
}

fn print_token(subject: &str, ttl_secs: Option<u64>, scope: &str) -> Result<()> {
    let config = WardenConfig::from_env().context("invalid environment configuration")?;
    if config.stream.secret.is_none() {
        anyhow::bail!("INTERNAL_SSE_SECRET must be set to mint tokens the server will accept");
    }
    let signer = TokenSigner::from_config(&config.stream)?;
    let ttl = ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(config.stream.token_ttl);
    let token = signer.issue(subject, ttl, scope)?;
    println!("{}", token);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            fleet,
            bind,
            dump,
            json,
        } => {
            init_tracing(json);
            run(fleet, bind, dump).await
        }
        Commands::Token {
            subject,
            ttl_secs,
            scope,
        } => print_token(&subject, ttl_secs, &scope),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗ Error:".red().bold(), e);
        std::process::exit(1);
    }
}
