//! `tasksync-server` -- reference task service for `TaskSync` clients.
//!
//! An axum WebSocket server keeping one document set per account in memory.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 127.0.0.1:9100
//! cargo run --bin tasksync-server
//!
//! # Require a shared token
//! cargo run --bin tasksync-server -- --bind 0.0.0.0:9100 --auth-token s3cret
//! ```

use std::sync::Arc;

use clap::Parser;
use tasksync_server::config::{ServerCliArgs, ServerConfig};
use tasksync_server::server::{self, ServerState};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        token_required = config.auth_token.is_some(),
        "starting task server"
    );

    let state = Arc::new(ServerState::with_config(
        config.auth_token.clone(),
        config.max_frame_size,
    ));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "task server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "task server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start task server");
            std::process::exit(1);
        }
    }
}
