use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use segdhcpd::backend;
use segdhcpd::catalog::Catalog;
use segdhcpd::config::Config;
use segdhcpd::context::Services;
use segdhcpd::error::Result;
use segdhcpd::mirror::{self, Mirror};
use segdhcpd::server::Server;
use segdhcpd::shard::InflightMacs;
use segdhcpd::stats::{self, Stats};

#[derive(Parser)]
#[command(name = "segdhcpd")]
#[command(author, version, about = "Relay-aware multi-segment DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "segdhcpd.json")]
    config: PathBuf,

    /// Fallback log filter; overridden by RUST_LOG and by log.level from
    /// the config file.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).await?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log.level.as_deref().unwrap_or(&cli.log_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("starting segdhcpd with config {:?}", cli.config);
            run(config).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => {
            Catalog::from_config(&config)?;
            println!("configuration OK");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let started = Instant::now();
    let config = Arc::new(config);
    let catalog = Arc::new(Catalog::from_config(&config)?);

    let mirror = Arc::new(Mirror::connect(&config.mirror).await?);
    mirror.selftest().await?;
    warn!("persistence mirror connected");

    let services = Arc::new(Services {
        config: Arc::clone(&config),
        catalog: Arc::clone(&catalog),
        stats: Arc::new(Stats::new()),
        inflight: Arc::new(InflightMacs::new()),
        reload_barrier: Arc::new(tokio::sync::RwLock::new(())),
        mirror: Some(Arc::clone(&mirror)),
    });

    // Prime the in-memory cache before serving.
    let subnet_records = mirror.scan_subnets().await?;
    let imported = mirror::import_subnets(&catalog, &subnet_records);
    warn!(imported, "automode subnets loaded from the mirror");

    let lease_records = mirror.scan_leases().await?;
    let (imported, duplicates) =
        mirror::import_leases(&catalog, &lease_records, chrono::Utc::now());
    warn!(imported, duplicates, "leases loaded from the mirror");

    backend::spawn_workers(Arc::clone(&services));
    spawn_signal_handler(Arc::clone(&services), started)?;

    let server = Server::new(Arc::clone(&services));
    tokio::select! {
        result = server.run() => result,
        _ = shutdown_signal() => {
            warn!("shutdown signal received, exiting");
            Ok(())
        }
    }
}

/// SIGHUP reloads the cache from the mirror, SIGUSR1 dumps statistics.
fn spawn_signal_handler(services: Arc<Services>, started: Instant) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    warn!("SIGHUP received, reloading cache");
                    let services = Arc::clone(&services);
                    tokio::spawn(async move {
                        if let Some(mirror) = &services.mirror {
                            let _ = mirror::cache_reload(
                                &services.catalog,
                                mirror,
                                &services.reload_barrier,
                            )
                            .await;
                        }
                    });
                }
                _ = user1.recv() => {
                    warn!("SIGUSR1 received, dumping statistics");
                    print!("{}", stats::dump_global(&services.stats, started.elapsed()));
                    print!("{}", stats::dump_segments(&services.catalog));
                    print!("{}", stats::dump_subnets(&services.catalog));
                    print!("{}", stats::dump_leases(&services.catalog));
                }
            }
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
