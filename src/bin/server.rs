use clap::Parser;
use spindle_server::{Config, Server};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the RESP listener
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Port for the memcache text-protocol listener (disabled if not set)
    #[arg(short = 'm', long)]
    memcache_port: Option<u16>,

    /// Number of engine shards (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("spindle_server={}", log_level))
        .init();

    let num_cpus = num_cpus::get();
    let threads = if args.threads == 0 {
        num_cpus
    } else {
        args.threads
    };

    info!(
        "starting spindle-server v{} on {}:{} ({} CPUs, {} shards)",
        env!("CARGO_PKG_VERSION"),
        args.bind,
        args.port,
        num_cpus,
        threads
    );

    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config {
            bind_addr: args.bind,
            port: args.port,
            memcache_port: args.memcache_port,
            threads,
            ..Default::default()
        }
    };

    let server = Arc::new(Server::new(config)?);

    let server_clone = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("received shutdown signal, shutting down gracefully...");
        server_clone.shutdown();
    })?;

    if let Err(e) = server.run() {
        error!("server error: {}", e);
        return Err(e.into());
    }

    info!("server shutdown complete");
    Ok(())
}
