//! Rootwalk
//!
//! An iterative DNS resolver: clients ask over UDP, the resolver walks the
//! delegation chain from the root hints and answers authoritatively.

use std::env;
use std::sync::Arc;

use log::info;
use tokio::{signal, task};

use rootwalk::{
    cache::{DnsCache, CACHE_CLEANUP_INTERVAL},
    config::ResolverConfig,
    errors::DnsError,
    handlers::run_udp_server,
    hints::RootHints,
    qlog::QueryLog,
    resolver::Resolver,
};

#[tokio::main]
async fn main() -> Result<(), DnsError> {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    // Load configuration; a positional argument overrides the bind port
    let mut config = ResolverConfig::from_env()?;
    if let Some(port_arg) = env::args().nth(1) {
        config.apply_port_arg(&port_arg)?;
    }

    let cache = Arc::new(DnsCache::new());
    let hints = Arc::new(RootHints::new(config.root_hints.clone()));
    let qlog = QueryLog::open(&config.query_log_path).await?;
    let resolver = Arc::new(Resolver::new(&config, Arc::clone(&cache), hints));

    // Set up cache sweep task
    let cache_sweep = task::spawn({
        let cache = Arc::clone(&cache);
        async move {
            let mut interval = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        }
    });

    // Set up shutdown signal handler
    let shutdown_signal = async {
        signal::ctrl_c().await.expect("Failed to listen for shutdown signal");
        info!("Shutdown signal received");
    };

    let udp_server = run_udp_server(config, resolver, qlog);

    // Wait for either a shutdown signal or a server error
    tokio::select! {
        _ = shutdown_signal => {
            info!("Initiating graceful shutdown...");
            cache_sweep.abort();
            Ok(())
        },
        res = udp_server => res,
    }
}
