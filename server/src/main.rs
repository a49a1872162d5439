use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::handlers::register_builtin;
use server::jobs::schedule_builtin;
use server::kernel::Kernel;
use server::network::NetworkServer;
use server::registry::MessageRegistry;
use std::path::PathBuf;

/// Parses arguments and configuration, wires the kernel, then serves until
/// Ctrl+C and shuts down gracefully.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// TOML configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Server port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// Maximum number of concurrent clients
        #[clap(short, long)]
        max_clients: Option<usize>,
        /// Seconds to count down before halting jobs and processors
        #[clap(long)]
        drain_delay: Option<u64>,
        /// Enable debug logging
        #[clap(short, long)]
        debug: bool,
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(drain_delay) = args.drain_delay {
        config.drain_delay_secs = drain_delay;
    }
    config.validate()?;

    let level = if args.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    info!("Starting server on {}", config.bind_address());
    info!("Max clients: {}", config.max_clients);

    let mut registry = MessageRegistry::new();
    register_builtin(&mut registry)?;

    let bind_address = config.bind_address();
    let kernel = Kernel::new(config, registry)?;
    schedule_builtin(&kernel.context())?;
    kernel.start();

    let server = NetworkServer::bind(&bind_address, kernel.context(), kernel.registry()).await?;
    let served = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await;

    let report = kernel.stop().await;
    for processor in &report.processors {
        info!(
            "Processor '{}': {} completed, {} dropped",
            processor.name, processor.completed, processor.dropped
        );
    }

    served?;
    Ok(())
}
