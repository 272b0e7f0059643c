//! Room server binary.
//!
//! Configured from `WATCHROOM_*` environment variables; log verbosity via
//! `RUST_LOG` (default `info`).

use watchroom_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => log::info!("Persisting rooms under {}", path.display()),
        None => log::info!("Rooms are kept in memory"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
